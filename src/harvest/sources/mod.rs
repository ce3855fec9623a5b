//! Source adapters.
//!
//! One [`SourceAdapter`] per upstream:
//! - [`github::GithubAdapter`]: repository snapshot over GraphQL
//! - [`npm::NpmAdapter`] / [`pypi::PypiAdapter`]: registry metadata plus the
//!   distribution archive, parsed by [`registry`]
//! - [`container::ContainerAdapter`]: Hub metadata plus the image config
//! - [`endpoint::EndpointAdapter`]: probe plus MCP handshake
//!
//! [`SourceKind`] names the closed set and [`build_adapter`] wires an
//! adapter to the shared [`HarvestContext`].

pub mod capabilities;
pub mod container;
pub mod endpoint;
pub mod github;
pub mod npm;
pub mod pypi;
pub mod registry;
pub mod risk;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::context::HarvestContext;
use crate::harvest::traits::SourceAdapter;
use crate::model::SourceType;

use self::registry::RegistryLimits;

/// The adapter an identifier is harvested with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Github,
    Npm,
    Pypi,
    Container,
    Endpoint,
}

impl SourceKind {
    pub const ALL: [SourceKind; 5] = [
        SourceKind::Github,
        SourceKind::Npm,
        SourceKind::Pypi,
        SourceKind::Container,
        SourceKind::Endpoint,
    ];

    /// Best guess from the identifier alone.
    ///
    /// Explicit prefixes (`github:`, `npm:`, `pypi:`, `docker:`) win. GitHub
    /// URLs go to [`Github`](Self::Github), any other `http(s)://` URL is an
    /// [`Endpoint`](Self::Endpoint). Scoped `@scope/name` is npm, a bare
    /// `owner/repo` is GitHub, and a bare name defaults to npm. PyPI and
    /// container names without a prefix are indistinguishable from npm
    /// names, so callers pass the kind explicitly for those.
    pub fn detect(identifier: &str) -> SourceKind {
        let id = identifier.trim();
        let lower = id.to_ascii_lowercase();

        for (prefix, kind) in [
            ("github:", SourceKind::Github),
            ("npm:", SourceKind::Npm),
            ("pypi:", SourceKind::Pypi),
            ("docker:", SourceKind::Container),
        ] {
            if lower.starts_with(prefix) {
                return kind;
            }
        }

        let without_scheme = lower
            .strip_prefix("https://")
            .or_else(|| lower.strip_prefix("http://"));
        match without_scheme {
            Some(rest) if rest.starts_with("github.com/") || rest.starts_with("www.github.com/") => {
                SourceKind::Github
            }
            Some(_) => SourceKind::Endpoint,
            None if lower.starts_with("github.com/") => SourceKind::Github,
            None if id.starts_with('@') => SourceKind::Npm,
            None if id.matches('/').count() == 1 => SourceKind::Github,
            None => SourceKind::Npm,
        }
    }

    pub fn source_type(&self) -> SourceType {
        match self {
            SourceKind::Github => SourceType::SourceControl,
            SourceKind::Npm => SourceType::Npm,
            SourceKind::Pypi => SourceType::Pypi,
            SourceKind::Container => SourceType::Container,
            SourceKind::Endpoint => SourceType::Endpoint,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Github => "github",
            SourceKind::Npm => "npm",
            SourceKind::Pypi => "pypi",
            SourceKind::Container => "container",
            SourceKind::Endpoint => "endpoint",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "github" | "source_control" => Ok(SourceKind::Github),
            "npm" => Ok(SourceKind::Npm),
            "pypi" => Ok(SourceKind::Pypi),
            "container" | "docker" => Ok(SourceKind::Container),
            "endpoint" => Ok(SourceKind::Endpoint),
            other => Err(format!("unknown source kind '{}'", other)),
        }
    }
}

impl From<SourceType> for SourceKind {
    fn from(source_type: SourceType) -> Self {
        match source_type {
            SourceType::SourceControl => SourceKind::Github,
            SourceType::Npm => SourceKind::Npm,
            SourceType::Pypi => SourceKind::Pypi,
            SourceType::Container => SourceKind::Container,
            SourceType::Endpoint => SourceKind::Endpoint,
        }
    }
}

/// Builds the adapter for `kind` on the context's shared client and stores.
pub fn build_adapter(kind: SourceKind, ctx: &HarvestContext) -> Arc<dyn SourceAdapter> {
    let config = ctx.config();
    let client = ctx.client().clone();
    let catalog = ctx.catalog().clone();
    let policy = ctx.network_policy();
    let sources = &config.sources;
    let limits = RegistryLimits {
        max_archive_bytes: config.archive.max_archive_bytes,
        max_scanned_files: config.archive.max_scanned_files,
        max_scanned_file_bytes: config.archive.max_scanned_file_bytes,
    };

    match kind {
        SourceKind::Github => Arc::new(github::GithubAdapter::new(
            client,
            catalog,
            policy,
            sources.github.clone(),
            config.health.source_control.clone(),
        )),
        SourceKind::Npm => Arc::new(npm::NpmAdapter::new(
            ctx.clients().clone(),
            catalog,
            policy,
            sources.npm.clone(),
            limits,
            config.health.registry.clone(),
        )),
        SourceKind::Pypi => Arc::new(pypi::PypiAdapter::new(
            ctx.clients().clone(),
            catalog,
            policy,
            sources.pypi.clone(),
            limits,
            config.health.registry.clone(),
        )),
        SourceKind::Container => Arc::new(container::ContainerAdapter::new(
            client,
            catalog,
            policy,
            sources.container.clone(),
            config.health.container.clone(),
        )),
        SourceKind::Endpoint => Arc::new(endpoint::EndpointAdapter::new(
            client,
            catalog,
            policy,
            sources.endpoint.clone(),
            config.health.endpoint.clone(),
        )),
    }
}
