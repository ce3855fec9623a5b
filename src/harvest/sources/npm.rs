//! npm registry adapter.
//!
//! `fetch` reads the packument (`GET {registry}/{name}`), follows
//! `dist-tags.latest` to its version document, downloads `dist.tarball`
//! under the archive ceiling and asks the downloads API for last month's
//! count. Parsing is shared with PyPI in [`registry`](super::registry).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::analysis::{HealthProfile, HealthScorer};
use crate::config::NpmConfig;
use crate::ecosystem::PackageJsonParser;
use crate::harvest::http::{download_bounded, send_with_retry, HttpClients};
use crate::harvest::retry::RetryPolicy;
use crate::harvest::sources::registry::{self, RegistryArtifact, RegistryLimits, RegistryMetadata};
use crate::harvest::store::CatalogStore;
use crate::harvest::traits::{HarvestError, RawArtifact, SourceAdapter};
use crate::model::{CatalogEntry, Release, SourceType};
use crate::traits::EcosystemParser;

const MAX_RELEASES: usize = 10;

/// The release `fetch` goes on to download.
#[derive(Debug, Clone, PartialEq)]
pub struct NpmRelease {
    pub version: String,
    pub tarball: String,
    pub unpacked_size: Option<u64>,
    pub metadata: RegistryMetadata,
}

/// Validates an npm identifier (`npm:name`, `@scope/name`, `name`).
pub fn package_name(identifier: &str) -> Result<String, HarvestError> {
    let name = identifier.trim();
    let name = name.strip_prefix("npm:").unwrap_or(name).trim();
    let scoped_ok = !name.starts_with('@')
        || name
            .split_once('/')
            .is_some_and(|(scope, pkg)| scope.len() > 1 && !pkg.is_empty() && !pkg.contains('/'));
    let valid = !name.is_empty()
        && scoped_ok
        && (name.starts_with('@') || !name.contains('/'))
        && !name.chars().any(char::is_whitespace);
    if valid {
        Ok(name.to_string())
    } else {
        Err(HarvestError::MalformedSource(format!(
            "'{}' is not an npm package name",
            identifier
        )))
    }
}

/// Path segment for a package; scoped names keep `@` and escape the slash.
fn encoded_name(name: &str) -> String {
    name.replace('/', "%2F")
}

/// Picks `dist-tags.latest` out of a packument.
///
/// # Errors
///
/// Returns [`HarvestError::MalformedSource`] if the latest tag, its version
/// document or its tarball URL is missing.
pub fn select_latest(doc: &Value) -> Result<NpmRelease, HarvestError> {
    let malformed = |what: &str| HarvestError::MalformedSource(format!("packument has no {}", what));

    let version = doc
        .pointer("/dist-tags/latest")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("dist-tags.latest"))?;
    let version_doc = doc
        .get("versions")
        .and_then(|v| v.get(version))
        .ok_or_else(|| malformed("version document for latest"))?;
    let tarball = version_doc
        .pointer("/dist/tarball")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed("dist.tarball"))?;

    let summary = match PackageJsonParser.parse(version_doc.to_string().as_bytes()) {
        Ok(summary) => summary,
        Err(e) => {
            warn!(version, error = %e, "Unreadable version document");
            Default::default()
        }
    };

    let time = doc.get("time").and_then(Value::as_object);
    let published_at = time
        .and_then(|t| t.get(version))
        .and_then(Value::as_str)
        .and_then(parse_time);

    let mut releases: Vec<Release> = time
        .map(|t| {
            t.iter()
                .filter(|(key, _)| *key != "created" && *key != "modified")
                .map(|(key, at)| Release {
                    version: key.clone(),
                    name: None,
                    published_at: at.as_str().and_then(parse_time),
                    url: None,
                    prerelease: key.contains('-'),
                })
                .collect()
        })
        .unwrap_or_default();
    releases.sort_by(|a, b| b.published_at.cmp(&a.published_at));
    releases.truncate(MAX_RELEASES);

    Ok(NpmRelease {
        version: version.to_string(),
        tarball: tarball.to_string(),
        unpacked_size: version_doc.pointer("/dist/unpackedSize").and_then(Value::as_u64),
        metadata: RegistryMetadata {
            description: summary
                .description
                .or_else(|| doc.get("description").and_then(Value::as_str).map(str::to_string)),
            license: summary.license,
            author: summary.author,
            homepage: summary.homepage,
            repository: summary.repository,
            readme: doc
                .get("readme")
                .and_then(Value::as_str)
                .filter(|r| !r.trim().is_empty())
                .map(str::to_string),
            published_at,
            downloads: 0,
            dependencies: summary.dependencies,
            releases,
        },
    })
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

pub struct NpmAdapter {
    client: Client,
    download: Client,
    catalog: CatalogStore,
    policy: RetryPolicy,
    config: NpmConfig,
    limits: RegistryLimits,
    scorer: HealthScorer,
}

impl NpmAdapter {
    pub fn new(
        clients: HttpClients,
        catalog: CatalogStore,
        policy: RetryPolicy,
        config: NpmConfig,
        limits: RegistryLimits,
        profile: HealthProfile,
    ) -> Self {
        Self {
            client: clients.api,
            download: clients.download,
            catalog,
            policy,
            config,
            limits,
            scorer: HealthScorer::new(profile),
        }
    }

    /// Last month's downloads; any failure counts as zero.
    async fn monthly_downloads(&self, name: &str) -> i64 {
        let url = format!(
            "{}/{}",
            self.config.downloads_url.trim_end_matches('/'),
            encoded_name(name)
        );
        let result = async {
            let response = send_with_retry(&self.policy, "npm downloads", || self.client.get(&url)).await?;
            let body: Value = response.json().await?;
            Ok::<i64, HarvestError>(body.get("downloads").and_then(Value::as_i64).unwrap_or(0))
        }
        .await;

        match result {
            Ok(downloads) => downloads,
            Err(e) => {
                warn!(package = name, error = %e, "Download count unavailable");
                0
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for NpmAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::Npm
    }

    fn locator_for(&self, identifier: &str) -> Result<String, HarvestError> {
        Ok(format!("npm:{}", package_name(identifier)?))
    }

    fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    #[instrument(skip(self), fields(source = "npm"))]
    async fn fetch(&self, identifier: &str) -> Result<RawArtifact, HarvestError> {
        let name = package_name(identifier)?;
        let url = format!(
            "{}/{}",
            self.config.registry_url.trim_end_matches('/'),
            encoded_name(&name)
        );

        let response = send_with_retry(&self.policy, "npm packument", || {
            self.client.get(&url).header("Accept", "application/json")
        })
        .await?;
        let doc: Value = response.json().await?;
        let mut release = select_latest(&doc)?;

        let ceiling = self.limits.max_archive_bytes;
        if let Some(size) = release.unpacked_size.filter(|size| *size > ceiling) {
            return Err(HarvestError::UnsafeArchive(format!(
                "{}@{} unpacks to {} bytes, ceiling is {}",
                name, release.version, size, ceiling
            )));
        }

        let tarball = send_with_retry(&self.policy, "npm tarball", || self.download.get(&release.tarball)).await?;
        let archive = download_bounded(tarball, ceiling).await?;
        release.metadata.downloads = self.monthly_downloads(&name).await;

        debug!(
            package = %name,
            version = %release.version,
            bytes = archive.len(),
            downloads = release.metadata.downloads,
            "Tarball downloaded"
        );

        Ok(RawArtifact::Registry(Box::new(RegistryArtifact {
            ecosystem: SourceType::Npm,
            locator: format!("npm:{}", name),
            name,
            version: release.version,
            distribution: release.tarball,
            archive,
            metadata: release.metadata,
        })))
    }

    async fn parse(&self, raw: RawArtifact) -> Result<CatalogEntry, HarvestError> {
        match raw {
            RawArtifact::Registry(artifact) if artifact.ecosystem == SourceType::Npm => {
                registry::build_entry(&artifact, self.limits, &self.scorer, Utc::now())
            }
            other => Err(HarvestError::MalformedSource(format!(
                "npm adapter cannot parse a {} artifact",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_package_name_forms() {
        assert_eq!(package_name("npm:left-pad").unwrap(), "left-pad");
        assert_eq!(package_name("@acme/weather").unwrap(), "@acme/weather");
        assert!(package_name("").is_err());
        assert!(package_name("@acme").is_err());
        assert!(package_name("a/b").is_err());
        assert!(package_name("has space").is_err());
        assert_eq!(encoded_name("@acme/weather"), "@acme%2Fweather");
    }

    #[test]
    fn test_select_latest() {
        let doc = json!({
            "name": "weather-mcp",
            "description": "top-level description",
            "readme": "# Weather",
            "dist-tags": {"latest": "1.2.0"},
            "time": {
                "created": "2024-01-01T00:00:00.000Z",
                "modified": "2024-03-01T00:00:00.000Z",
                "1.1.0": "2024-02-01T00:00:00.000Z",
                "1.2.0": "2024-03-01T00:00:00.000Z",
                "2.0.0-beta.1": "2024-02-15T00:00:00.000Z"
            },
            "versions": {
                "1.2.0": {
                    "name": "weather-mcp",
                    "version": "1.2.0",
                    "license": "MIT",
                    "repository": {"url": "git+https://github.com/acme/weather-mcp.git"},
                    "dependencies": {"zod": "^3.0.0"},
                    "dist": {"tarball": "https://registry.npmjs.org/weather-mcp/-/weather-mcp-1.2.0.tgz", "unpackedSize": 12345}
                }
            }
        });
        let release = select_latest(&doc).unwrap();
        assert_eq!(release.version, "1.2.0");
        assert_eq!(release.unpacked_size, Some(12345));
        assert_eq!(release.metadata.license.as_deref(), Some("MIT"));
        assert_eq!(release.metadata.description.as_deref(), Some("top-level description"));
        assert_eq!(
            release.metadata.repository.as_deref(),
            Some("https://github.com/acme/weather-mcp")
        );
        let versions: Vec<&str> = release.metadata.releases.iter().map(|r| r.version.as_str()).collect();
        assert_eq!(versions, vec!["1.2.0", "2.0.0-beta.1", "1.1.0"]);
        assert!(release.metadata.releases[1].prerelease);
        assert!(release.metadata.published_at.is_some());
    }

    #[test]
    fn test_select_latest_requires_tarball() {
        let doc = json!({"dist-tags": {"latest": "1.0.0"}, "versions": {"1.0.0": {"dist": {}}}});
        assert!(matches!(
            select_latest(&doc),
            Err(HarvestError::MalformedSource(_))
        ));
        assert!(select_latest(&json!({})).is_err());
    }
}
