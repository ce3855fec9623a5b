//! Container image adapter (Docker Hub + registry HTTP API v2).
//!
//! `fetch` reads the Hub repository metadata, resolves the tag to a single
//! image manifest (selecting the configured platform out of a manifest list
//! or OCI index) and downloads only the image config blob. Layers are never
//! pulled: everything the catalog needs sits in the config.
//!
//! Anonymous registry access follows the bearer challenge flow: a `401`
//! carries `WWW-Authenticate: Bearer realm=..,service=..,scope=..`, the
//! token is requested from the realm and the request is repeated once.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::analysis::{HealthProfile, HealthScorer, HealthSignals};
use crate::config::ContainerConfig;
use crate::ecosystem::{is_linkable_repository, normalize_repository_url};
use crate::harvest::http::{check_status, classify_status, download_bounded, send_with_retry};
use crate::harvest::retry::RetryPolicy;
use crate::harvest::sources::risk;
use crate::harvest::store::CatalogStore;
use crate::harvest::traits::{HarvestError, RawArtifact, SourceAdapter};
use crate::model::{CatalogEntry, SourceType};

const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.index.v1+json";

const CONFIG_ACCEPT: &str = "application/vnd.docker.container.image.v1+json, \
     application/vnd.oci.image.config.v1+json, application/json";

/// Image configs are a few KiB; anything near this is not a config.
const MAX_CONFIG_BYTES: u64 = 4 * 1024 * 1024;

const SHELLS: &[&str] = &["sh", "bash", "ash", "dash", "zsh"];

// ============================================================================
// Image References
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub namespace: String,
    pub repository: String,
    /// Tag or `sha256:` digest
    pub reference: String,
}

impl ImageReference {
    /// Parses `docker:ns/repo[:tag]`, `ns/repo[:tag]` or `repo[:tag]`.
    /// Single-segment names live in the `library/` namespace.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::MalformedSource`] for registry-qualified or
    /// otherwise unrecognizable names.
    pub fn parse(identifier: &str, default_tag: &str) -> Result<Self, HarvestError> {
        let malformed = || {
            HarvestError::MalformedSource(format!("'{}' is not a container image name", identifier))
        };
        let raw = identifier.trim();
        let raw = raw.strip_prefix("docker:").unwrap_or(raw);

        let (path, reference) = if let Some((path, digest)) = raw.split_once('@') {
            (path, digest.to_string())
        } else {
            match raw.rsplit_once(':') {
                Some((path, tag)) if !tag.contains('/') => (path, tag.to_string()),
                _ => (raw, default_tag.to_string()),
            }
        };

        let segments: Vec<&str> = path.split('/').collect();
        let (namespace, repository) = match segments.as_slice() {
            [repo] => ("library", *repo),
            [ns, repo] => (*ns, *repo),
            _ => return Err(malformed()),
        };
        let valid = |s: &str| {
            !s.is_empty()
                && s.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        };
        if !valid(namespace) || !valid(repository) || reference.is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            namespace: namespace.to_ascii_lowercase(),
            repository: repository.to_ascii_lowercase(),
            reference,
        })
    }

    pub fn name(&self) -> String {
        format!("{}/{}", self.namespace, self.repository)
    }

    pub fn locator(&self) -> String {
        format!("docker:{}", self.name())
    }
}

// ============================================================================
// Artifact
// ============================================================================

/// Docker Hub repository metadata.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct HubMetadata {
    pub description: Option<String>,
    pub star_count: i64,
    pub pull_count: i64,
    pub last_updated: Option<String>,
}

impl HubMetadata {
    pub fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        self.last_updated
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// The parts of an image config blob that the catalog reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageConfig {
    pub os: Option<String>,
    pub architecture: Option<String>,
    pub created: Option<DateTime<Utc>>,
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
}

#[derive(Deserialize)]
struct ConfigBlob {
    os: Option<String>,
    architecture: Option<String>,
    created: Option<String>,
    #[serde(default)]
    config: Option<RuntimeConfig>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
struct RuntimeConfig {
    env: Option<Vec<String>>,
    labels: Option<BTreeMap<String, String>>,
    entrypoint: Option<Vec<String>>,
    cmd: Option<Vec<String>>,
}

impl ImageConfig {
    /// Parses an image config blob (Docker v1 or OCI config media type).
    pub fn from_blob(bytes: &[u8]) -> Result<Self, HarvestError> {
        let blob: ConfigBlob = serde_json::from_slice(bytes)?;
        let runtime = blob.config.unwrap_or_default();
        Ok(Self {
            os: blob.os,
            architecture: blob.architecture,
            created: blob
                .created
                .as_deref()
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .map(|t| t.with_timezone(&Utc)),
            env: runtime.env.unwrap_or_default(),
            labels: runtime.labels.unwrap_or_default(),
            entrypoint: runtime.entrypoint.unwrap_or_default(),
            cmd: runtime.cmd.unwrap_or_default(),
        })
    }

    /// Entrypoint followed by cmd, the way the runtime concatenates them.
    pub fn command(&self) -> impl Iterator<Item = &str> {
        self.entrypoint.iter().chain(self.cmd.iter()).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct ContainerArtifact {
    pub image: ImageReference,
    /// `None` when Hub metadata could not be read
    pub hub: Option<HubMetadata>,
    pub manifest_digest: Option<String>,
    pub config: ImageConfig,
}

// ============================================================================
// Pure Helpers
// ============================================================================

/// A parsed `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

/// Parses a bearer challenge. Quoted values may contain commas.
pub fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let header = header.trim();
    let (scheme, params) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut values: BTreeMap<String, String> = BTreeMap::new();
    let mut rest = params.trim();
    while !rest.is_empty() {
        let (key, after) = rest.split_once('=')?;
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();
        let after = after.trim_start();
        let (value, remaining) = if let Some(quoted) = after.strip_prefix('"') {
            let end = quoted.find('"')?;
            (&quoted[..end], &quoted[end + 1..])
        } else {
            let end = after.find(',').unwrap_or(after.len());
            (&after[..end], &after[end..])
        };
        values.insert(key, value.to_string());
        rest = remaining.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
    }

    Some(BearerChallenge {
        realm: values.remove("realm").filter(|r| !r.is_empty())?,
        service: values.remove("service"),
        scope: values.remove("scope"),
    })
}

/// Whether a manifest document is a list/index rather than an image manifest.
pub fn is_index(manifest: &Value) -> bool {
    let media_type = manifest
        .get("mediaType")
        .and_then(Value::as_str)
        .unwrap_or("");
    media_type.contains("manifest.list") || media_type.contains("image.index") || manifest.get("manifests").is_some()
}

/// Digest of the manifest for `os`/`architecture` in a list or index.
pub fn select_platform<'a>(index: &'a Value, os: &str, architecture: &str) -> Option<&'a str> {
    index
        .get("manifests")
        .and_then(Value::as_array)?
        .iter()
        .find(|m| {
            let platform = m.get("platform");
            platform.and_then(|p| p.get("os")).and_then(Value::as_str) == Some(os)
                && platform
                    .and_then(|p| p.get("architecture"))
                    .and_then(Value::as_str)
                    == Some(architecture)
        })
        .and_then(|m| m.get("digest"))
        .and_then(Value::as_str)
}

fn program(token: &str) -> &str {
    token.rsplit('/').next().unwrap_or(token)
}

/// Words of the command line; shell-form strings are split on whitespace.
fn command_words(config: &ImageConfig) -> Vec<&str> {
    config
        .command()
        .flat_map(str::split_whitespace)
        .map(|w| w.trim_matches(|c| c == '\'' || c == '"'))
        .filter(|w| !w.is_empty())
        .collect()
}

/// Independent hints that an image runs an MCP server, as `kind:value`.
pub fn mcp_signals(config: &ImageConfig) -> Vec<String> {
    let mut signals = Vec::new();

    for var in &config.env {
        let name = var.split('=').next().unwrap_or("").to_ascii_uppercase();
        if name.starts_with("MCP_") || name.contains("_MCP_") || name.ends_with("_MCP") {
            signals.push(format!("env:{}", name));
        }
    }

    for (key, value) in &config.labels {
        let key_lower = key.to_ascii_lowercase();
        if key_lower.starts_with("io.modelcontextprotocol.")
            || key_lower.contains("mcp")
            || value.to_ascii_lowercase().contains("mcp")
        {
            signals.push(format!("label:{}", key));
        }
    }

    for word in command_words(config) {
        let prog = program(word);
        if prog == "mcp"
            || prog.starts_with("mcp-server")
            || prog == "fastmcp"
            || word.contains("@modelcontextprotocol/")
        {
            signals.push(format!("command:{}", word));
        }
    }

    let mut seen = std::collections::HashSet::new();
    signals.retain(|s| seen.insert(s.clone()));
    signals
}

/// `sh -c`, `bash -c` and friends anywhere in the command line.
pub fn is_shell_entrypoint(config: &ImageConfig) -> bool {
    command_words(config)
        .windows(2)
        .any(|pair| SHELLS.contains(&program(pair[0])) && pair[1] == "-c")
}

/// Builds and scores the entry for a fetched image.
pub fn build_entry(artifact: &ContainerArtifact, scorer: &HealthScorer, now: DateTime<Utc>) -> CatalogEntry {
    let image = &artifact.image;
    let config = &artifact.config;
    let hub = artifact.hub.clone().unwrap_or_default();
    let label = |key: &str| config.labels.get(key).filter(|v| !v.trim().is_empty()).cloned();

    let mut entry = CatalogEntry::new(image.locator(), SourceType::Container, image.name());
    entry.version = Some(image.reference.clone());
    entry.description = hub
        .description
        .clone()
        .filter(|d| !d.trim().is_empty())
        .or_else(|| label("org.opencontainers.image.description"));
    entry.license = label("org.opencontainers.image.licenses");
    entry.author = label("org.opencontainers.image.authors").or_else(|| label("maintainer"));
    entry.homepage = label("org.opencontainers.image.url");
    entry.repository_url = label("org.opencontainers.image.source")
        .as_deref()
        .and_then(normalize_repository_url)
        .filter(|url| is_linkable_repository(url));
    entry.stars = hub.star_count;
    entry.downloads = hub.pull_count;
    entry.verified = risk::is_official_image(&entry.locator);
    entry.last_activity_at = hub.last_updated_at().or(config.created);
    entry.harvested_at = now;

    let signals = mcp_signals(config);
    let platform = match (&config.os, &config.architecture) {
        (Some(os), Some(arch)) => Some(format!("{}/{}", os, arch)),
        _ => None,
    };
    let metadata = &mut entry.metadata;
    metadata.insert(risk::SHELL_ENTRYPOINT_KEY.to_string(), json!(is_shell_entrypoint(config)));
    metadata.insert("mcp_candidate".to_string(), json!(!signals.is_empty()));
    metadata.insert("mcp_signals".to_string(), json!(signals));
    metadata.insert("entrypoint".to_string(), json!(config.entrypoint));
    metadata.insert("cmd".to_string(), json!(config.cmd));
    metadata.insert("platform".to_string(), json!(platform));
    metadata.insert("digest".to_string(), json!(artifact.manifest_digest));
    metadata.insert("hub_metadata".to_string(), json!(artifact.hub.is_some()));

    entry.risk_level = risk::assess(&entry, &[]);

    let signals = HealthSignals {
        stars: entry.stars,
        downloads: entry.downloads,
        has_description: entry.description.is_some(),
        has_license: entry.license.is_some(),
        has_linked_repository: entry.repository_url.is_some(),
        ..HealthSignals::default()
    }
    .with_activity(entry.last_activity_at, now);
    entry.health_score = scorer.score(&signals);

    entry
}

// ============================================================================
// Adapter
// ============================================================================

pub struct ContainerAdapter {
    client: Client,
    catalog: CatalogStore,
    policy: RetryPolicy,
    config: ContainerConfig,
    scorer: HealthScorer,
}

impl ContainerAdapter {
    pub fn new(
        client: Client,
        catalog: CatalogStore,
        policy: RetryPolicy,
        config: ContainerConfig,
        profile: HealthProfile,
    ) -> Self {
        Self {
            client,
            catalog,
            policy,
            config,
            scorer: HealthScorer::new(profile),
        }
    }

    /// Hub metadata; 404 means the image does not exist.
    async fn hub_metadata(&self, image: &ImageReference) -> Result<Option<HubMetadata>, HarvestError> {
        let url = format!(
            "{}/v2/repositories/{}/{}/",
            self.config.hub_url.trim_end_matches('/'),
            image.namespace,
            image.repository
        );
        let result = async {
            let response = send_with_retry(&self.policy, "Docker Hub", || self.client.get(&url)).await?;
            let body = response.bytes().await?;
            Ok::<HubMetadata, HarvestError>(serde_json::from_slice(&body)?)
        }
        .await;

        match result {
            Ok(hub) => Ok(Some(hub)),
            Err(e) if e.is_not_found() => Err(e),
            Err(e) => {
                warn!(image = %image.name(), error = %e, "Hub metadata unavailable");
                Ok(None)
            }
        }
    }

    /// One registry GET; 401 is passed through for the challenge flow.
    async fn send_registry(&self, url: &str, accept: &str, token: Option<&str>) -> Result<Response, HarvestError> {
        self.policy
            .run("container registry", || async {
                let mut request = self.client.get(url).header(ACCEPT, accept);
                if let Some(token) = token {
                    request = request.bearer_auth(token);
                }
                let response = request.send().await?;
                let status = response.status();
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    return Err(classify_status(status, "container registry"));
                }
                Ok(response)
            })
            .await
    }

    async fn registry_get(
        &self,
        image: &ImageReference,
        url: &str,
        accept: &str,
        token: &mut Option<String>,
    ) -> Result<Response, HarvestError> {
        let response = self.send_registry(url, accept, token.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED || token.is_some() {
            return check_status(response, "container registry");
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge)
            .ok_or_else(|| {
                HarvestError::AuthRequired("registry answered 401 without a bearer challenge".to_string())
            })?;
        *token = Some(self.exchange_token(image, &challenge).await?);

        let response = self.send_registry(url, accept, token.as_deref()).await?;
        check_status(response, "container registry")
    }

    async fn exchange_token(&self, image: &ImageReference, challenge: &BearerChallenge) -> Result<String, HarvestError> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", image.name()));
        let mut params = vec![("scope", scope)];
        if let Some(service) = &challenge.service {
            params.push(("service", service.clone()));
        }
        let token_url = url::Url::parse_with_params(&challenge.realm, &params)
            .map_err(|e| HarvestError::AuthRequired(format!("invalid token realm: {}", e)))?;

        let response = send_with_retry(&self.policy, "registry token", || self.client.get(token_url.clone())).await?;
        let body: Value = response.json().await?;
        body.get("token")
            .or_else(|| body.get("access_token"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| HarvestError::AuthRequired("token endpoint returned no token".to_string()))
    }
}

#[async_trait]
impl SourceAdapter for ContainerAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::Container
    }

    fn locator_for(&self, identifier: &str) -> Result<String, HarvestError> {
        Ok(ImageReference::parse(identifier, &self.config.default_tag)?.locator())
    }

    fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    #[instrument(skip(self), fields(source = "container"))]
    async fn fetch(&self, identifier: &str) -> Result<RawArtifact, HarvestError> {
        let image = ImageReference::parse(identifier, &self.config.default_tag)?;
        let hub = self.hub_metadata(&image).await?;

        let registry = self.config.registry_url.trim_end_matches('/');
        let mut token = None;
        let manifest_url = |reference: &str| format!("{}/v2/{}/manifests/{}", registry, image.name(), reference);

        let response = self
            .registry_get(&image, &manifest_url(&image.reference), MANIFEST_ACCEPT, &mut token)
            .await?;
        let mut digest = content_digest(&response);
        let mut manifest: Value = response.json().await?;

        if is_index(&manifest) {
            let selected = select_platform(
                &manifest,
                &self.config.platform_os,
                &self.config.platform_architecture,
            )
            .ok_or_else(|| {
                HarvestError::MalformedSource(format!(
                    "{}:{} has no {}/{} image",
                    image.name(),
                    image.reference,
                    self.config.platform_os,
                    self.config.platform_architecture
                ))
            })?
            .to_string();
            let response = self
                .registry_get(&image, &manifest_url(&selected), MANIFEST_ACCEPT, &mut token)
                .await?;
            manifest = response.json().await?;
            digest = Some(selected);
        }

        let config_digest = manifest
            .pointer("/config/digest")
            .and_then(Value::as_str)
            .ok_or_else(|| HarvestError::MalformedSource("image manifest has no config digest".to_string()))?;
        let blob_url = format!("{}/v2/{}/blobs/{}", registry, image.name(), config_digest);
        let response = self.registry_get(&image, &blob_url, CONFIG_ACCEPT, &mut token).await?;
        let config = ImageConfig::from_blob(&download_bounded(response, MAX_CONFIG_BYTES).await?)?;

        debug!(
            image = %image.name(),
            reference = %image.reference,
            digest = ?digest,
            hub = hub.is_some(),
            "Image config fetched"
        );

        Ok(RawArtifact::Container(Box::new(ContainerArtifact {
            image,
            hub,
            manifest_digest: digest,
            config,
        })))
    }

    async fn parse(&self, raw: RawArtifact) -> Result<CatalogEntry, HarvestError> {
        match raw {
            RawArtifact::Container(artifact) => Ok(build_entry(&artifact, &self.scorer, Utc::now())),
            other => Err(HarvestError::MalformedSource(format!(
                "container adapter cannot parse a {} artifact",
                other.kind()
            ))),
        }
    }
}

fn content_digest(response: &Response) -> Option<String> {
    response
        .headers()
        .get("docker-content-digest")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RiskLevel;
    use chrono::Duration;

    fn scorer() -> HealthScorer {
        HealthScorer::new(HealthProfile::container())
    }

    fn artifact(identifier: &str, config: ImageConfig, hub: Option<HubMetadata>) -> ContainerArtifact {
        ContainerArtifact {
            image: ImageReference::parse(identifier, "latest").unwrap(),
            hub,
            manifest_digest: Some("sha256:abc".to_string()),
            config,
        }
    }

    #[test]
    fn test_image_reference_forms() {
        let node = ImageReference::parse("node", "latest").unwrap();
        assert_eq!(node.locator(), "docker:library/node");
        assert_eq!(node.reference, "latest");

        let tagged = ImageReference::parse("docker:Acme/MCP-Weather:1.2", "latest").unwrap();
        assert_eq!(tagged.locator(), "docker:acme/mcp-weather");
        assert_eq!(tagged.reference, "1.2");

        let pinned = ImageReference::parse("acme/weather@sha256:0123", "latest").unwrap();
        assert_eq!(pinned.reference, "sha256:0123");

        assert!(ImageReference::parse("ghcr.io/acme/weather", "latest").is_err());
        assert!(ImageReference::parse("docker:", "latest").is_err());
    }

    #[test]
    fn test_bearer_challenge() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/node:pull,push""#;
        let challenge = parse_bearer_challenge(header).unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(challenge.scope.as_deref(), Some("repository:library/node:pull,push"));

        assert!(parse_bearer_challenge("Basic realm=\"x\"").is_none());
        assert!(parse_bearer_challenge("Bearer service=\"x\"").is_none());
    }

    #[test]
    fn test_platform_selection() {
        let index = json!({
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [
                {"digest": "sha256:arm", "platform": {"os": "linux", "architecture": "arm64"}},
                {"digest": "sha256:amd", "platform": {"os": "linux", "architecture": "amd64"}}
            ]
        });
        assert!(is_index(&index));
        assert_eq!(select_platform(&index, "linux", "amd64"), Some("sha256:amd"));
        assert_eq!(select_platform(&index, "windows", "amd64"), None);

        let manifest = json!({"mediaType": "application/vnd.docker.distribution.manifest.v2+json", "config": {"digest": "sha256:c"}});
        assert!(!is_index(&manifest));
    }

    #[test]
    fn test_config_blob_and_signals() {
        let blob = br#"{
            "os": "linux", "architecture": "amd64", "created": "2024-05-01T00:00:00Z",
            "config": {
                "Env": ["PATH=/usr/bin", "MCP_TRANSPORT=stdio", "WEATHER_MCP_PORT=8080"],
                "Labels": {"io.modelcontextprotocol.server.name": "weather", "vendor": "acme"},
                "Entrypoint": ["npx", "-y", "@modelcontextprotocol/server-weather"],
                "Cmd": null
            }
        }"#;
        let config = ImageConfig::from_blob(blob).unwrap();
        assert_eq!(config.cmd, Vec::<String>::new());
        assert_eq!(
            mcp_signals(&config),
            vec![
                "env:MCP_TRANSPORT",
                "env:WEATHER_MCP_PORT",
                "label:io.modelcontextprotocol.server.name",
                "command:@modelcontextprotocol/server-weather",
            ]
        );
        assert!(!is_shell_entrypoint(&config));

        let plain = ImageConfig {
            cmd: vec!["node".to_string(), "server.js".to_string()],
            ..ImageConfig::default()
        };
        assert!(mcp_signals(&plain).is_empty());
    }

    #[test]
    fn test_shell_entrypoint_detection() {
        let exec_form = ImageConfig {
            entrypoint: vec!["/bin/sh".to_string(), "-c".to_string()],
            cmd: vec!["mcp-server-fetch --port 80".to_string()],
            ..ImageConfig::default()
        };
        assert!(is_shell_entrypoint(&exec_form));
        assert!(mcp_signals(&exec_form).contains(&"command:mcp-server-fetch".to_string()));

        let shell_string = ImageConfig {
            cmd: vec!["bash -c 'python app.py'".to_string()],
            ..ImageConfig::default()
        };
        assert!(is_shell_entrypoint(&shell_string));
    }

    #[test]
    fn test_official_image_entry() {
        let now = Utc::now();
        let hub = HubMetadata {
            description: Some("Node.js runtime".to_string()),
            star_count: 13_000,
            pull_count: 1_000_000_000,
            last_updated: Some((now - Duration::days(3)).to_rfc3339()),
        };
        let config = ImageConfig {
            cmd: vec!["node".to_string()],
            ..ImageConfig::default()
        };
        let entry = build_entry(&artifact("node", config, Some(hub)), &scorer(), now);

        assert_eq!(entry.locator, "docker:library/node");
        assert!(entry.verified);
        assert_eq!(entry.risk_level, RiskLevel::Safe);
        assert_eq!(entry.metadata["mcp_candidate"], json!(false));
        // 30 base + 25 pulls + 15 stars + 10 description + 10 recency
        assert_eq!(entry.health_score, 90);
    }

    #[test]
    fn test_unofficial_shell_image_is_high() {
        let config = ImageConfig {
            entrypoint: vec!["sh".to_string(), "-c".to_string(), "mcp-server".to_string()],
            ..ImageConfig::default()
        };
        let entry = build_entry(&artifact("acme/tools:2", config, None), &scorer(), Utc::now());
        assert_eq!(entry.version.as_deref(), Some("2"));
        assert_eq!(entry.risk_level, RiskLevel::High);
        assert_eq!(entry.metadata["mcp_candidate"], json!(true));
        assert_eq!(entry.metadata["hub_metadata"], json!(false));
        assert_eq!(entry.health_score, 30);
    }
}
