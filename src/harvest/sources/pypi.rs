//! PyPI adapter.
//!
//! `fetch` reads `GET {index}/pypi/{name}/json`, picks a distribution of the
//! latest release (wheel preferred, sdist otherwise) and downloads it under
//! the archive ceiling. Parsing is shared with npm in
//! [`registry`](super::registry).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, instrument};

use crate::analysis::{HealthProfile, HealthScorer};
use crate::config::PypiConfig;
use crate::ecosystem::{normalize_pypi_name, normalize_repository_url, requirement_dependency};
use crate::harvest::http::{download_bounded, send_with_retry, HttpClients};
use crate::harvest::retry::RetryPolicy;
use crate::harvest::sources::registry::{self, RegistryArtifact, RegistryLimits, RegistryMetadata};
use crate::harvest::store::CatalogStore;
use crate::harvest::traits::{HarvestError, RawArtifact, SourceAdapter};
use crate::model::{CatalogEntry, DependencyKind, Release, SourceType};

const MAX_RELEASES: usize = 10;

/// `project_urls` keys that usually point at the source repository, in
/// order of preference.
const REPOSITORY_KEYS: &[&str] = &["source", "source code", "repository", "code", "github", "homepage"];

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ProjectDocument {
    pub info: ProjectInfo,
    #[serde(default)]
    pub urls: Vec<DistributionFile>,
    #[serde(default)]
    pub releases: HashMap<String, Vec<DistributionFile>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProjectInfo {
    pub name: String,
    pub version: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub license: Option<String>,
    pub author: Option<String>,
    pub author_email: Option<String>,
    pub home_page: Option<String>,
    pub project_urls: Option<HashMap<String, String>>,
    pub requires_dist: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DistributionFile {
    pub packagetype: String,
    pub filename: String,
    pub url: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub upload_time_iso_8601: Option<String>,
    #[serde(default)]
    pub yanked: bool,
}

/// Validates a PyPI identifier and returns its normalized project name.
pub fn project_name(identifier: &str) -> Result<String, HarvestError> {
    let name = identifier.trim();
    let name = name.strip_prefix("pypi:").unwrap_or(name);
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(normalize_pypi_name(name))
    } else {
        Err(HarvestError::MalformedSource(format!(
            "'{}' is not a PyPI project name",
            identifier
        )))
    }
}

/// Wheel first, then a `.tar.gz` or `.zip` sdist. Yanked files are ignored.
pub fn select_distribution(files: &[DistributionFile]) -> Option<&DistributionFile> {
    let live = || files.iter().filter(|f| !f.yanked);
    live()
        .find(|f| f.packagetype == "bdist_wheel" && f.filename.ends_with(".whl"))
        .or_else(|| {
            live().find(|f| {
                f.packagetype == "sdist"
                    && (f.filename.ends_with(".tar.gz") || f.filename.ends_with(".zip"))
            })
        })
}

/// Registry-side metadata of the latest release.
pub fn registry_metadata(doc: &ProjectDocument, file: Option<&DistributionFile>) -> RegistryMetadata {
    let info = &doc.info;
    let project_urls: HashMap<String, &String> = info
        .project_urls
        .iter()
        .flatten()
        .map(|(k, v)| (k.to_ascii_lowercase(), v))
        .collect();
    let repository = REPOSITORY_KEYS
        .iter()
        .filter_map(|key| project_urls.get(*key))
        .filter_map(|url| normalize_repository_url(url))
        .next()
        .or_else(|| info.home_page.as_deref().and_then(normalize_repository_url));

    let dependencies = info
        .requires_dist
        .iter()
        .flatten()
        .filter_map(|raw| requirement_dependency(raw, DependencyKind::Runtime))
        .collect();

    let mut releases: Vec<Release> = doc
        .releases
        .iter()
        .filter(|(_, files)| !files.is_empty())
        .map(|(version, files)| Release {
            version: version.clone(),
            name: None,
            published_at: files
                .iter()
                .filter_map(|f| f.upload_time_iso_8601.as_deref().and_then(parse_time))
                .min(),
            url: None,
            prerelease: is_prerelease(version),
        })
        .collect();
    releases.sort_by(|a, b| b.published_at.cmp(&a.published_at));
    releases.truncate(MAX_RELEASES);

    let author = info
        .author
        .clone()
        .filter(|a| !a.trim().is_empty())
        .or_else(|| info.author_email.clone().filter(|a| !a.trim().is_empty()));

    RegistryMetadata {
        description: non_empty(&info.summary),
        license: non_empty(&info.license),
        author,
        homepage: non_empty(&info.home_page),
        repository,
        readme: non_empty(&info.description),
        published_at: file
            .and_then(|f| f.upload_time_iso_8601.as_deref())
            .and_then(parse_time),
        downloads: 0,
        dependencies,
        releases,
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty() && *v != "UNKNOWN")
        .map(str::to_string)
}

/// PEP 440 pre- and dev-releases.
fn is_prerelease(version: &str) -> bool {
    let v = version.to_ascii_lowercase();
    ["a", "b", "rc", "dev", "pre"].iter().any(|tag| {
        v.split(|c: char| c == '.' || c == '-')
            .any(|part| part.trim_start_matches(|c: char| c.is_ascii_digit()).starts_with(tag))
    })
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

// ============================================================================
// Adapter
// ============================================================================

pub struct PypiAdapter {
    client: Client,
    download: Client,
    catalog: CatalogStore,
    policy: RetryPolicy,
    config: PypiConfig,
    limits: RegistryLimits,
    scorer: HealthScorer,
}

impl PypiAdapter {
    pub fn new(
        clients: HttpClients,
        catalog: CatalogStore,
        policy: RetryPolicy,
        config: PypiConfig,
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
}

#[async_trait]
impl SourceAdapter for PypiAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::Pypi
    }

    fn locator_for(&self, identifier: &str) -> Result<String, HarvestError> {
        Ok(format!("pypi:{}", project_name(identifier)?))
    }

    fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    #[instrument(skip(self), fields(source = "pypi"))]
    async fn fetch(&self, identifier: &str) -> Result<RawArtifact, HarvestError> {
        let name = project_name(identifier)?;
        let url = format!(
            "{}/pypi/{}/json",
            self.config.index_url.trim_end_matches('/'),
            name
        );

        let response = send_with_retry(&self.policy, "PyPI project", || self.client.get(&url)).await?;
        let body = response.bytes().await?;
        let doc: ProjectDocument = serde_json::from_slice(&body)?;

        let file = select_distribution(&doc.urls)
            .cloned()
            .ok_or_else(|| {
                HarvestError::MalformedSource(format!(
                    "{} {} has no wheel or sdist",
                    name, doc.info.version
                ))
            })?;
        let ceiling = self.limits.max_archive_bytes;
        if let Some(size) = file.size.filter(|size| *size > ceiling) {
            return Err(HarvestError::UnsafeArchive(format!(
                "{} is {} bytes, ceiling is {}",
                file.filename, size, ceiling
            )));
        }

        let download = send_with_retry(&self.policy, "PyPI distribution", || self.download.get(&file.url)).await?;
        let archive = download_bounded(download, ceiling).await?;
        let metadata = registry_metadata(&doc, Some(&file));

        debug!(
            project = %name,
            version = %doc.info.version,
            distribution = %file.filename,
            bytes = archive.len(),
            "Distribution downloaded"
        );

        let published = if doc.info.name.is_empty() {
            name.clone()
        } else {
            doc.info.name.clone()
        };
        Ok(RawArtifact::Registry(Box::new(RegistryArtifact {
            ecosystem: SourceType::Pypi,
            locator: format!("pypi:{}", name),
            name: published,
            version: doc.info.version,
            distribution: file.filename,
            archive,
            metadata,
        })))
    }

    async fn parse(&self, raw: RawArtifact) -> Result<CatalogEntry, HarvestError> {
        match raw {
            RawArtifact::Registry(artifact) if artifact.ecosystem == SourceType::Pypi => {
                registry::build_entry(&artifact, self.limits, &self.scorer, Utc::now())
            }
            other => Err(HarvestError::MalformedSource(format!(
                "PyPI adapter cannot parse a {} artifact",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"{
        "info": {
            "name": "Weather_MCP",
            "version": "0.3.0",
            "summary": "Weather tools",
            "description": "",
            "license": "Apache-2.0",
            "author": "",
            "author_email": "ops@acme.dev",
            "home_page": null,
            "project_urls": {"Homepage": "https://acme.dev", "Source": "https://github.com/acme/weather-mcp"},
            "requires_dist": ["mcp>=1.0", "httpx (>=0.27)", "pytest ; extra == 'test'"]
        },
        "urls": [
            {"packagetype": "sdist", "filename": "weather_mcp-0.3.0.tar.gz", "url": "https://files/sdist", "size": 2048,
             "upload_time_iso_8601": "2024-05-02T10:00:00.000000Z"},
            {"packagetype": "bdist_wheel", "filename": "weather_mcp-0.3.0-py3-none-any.whl", "url": "https://files/wheel", "size": 1024,
             "upload_time_iso_8601": "2024-05-02T10:00:00.000000Z"}
        ],
        "releases": {
            "0.2.0": [{"packagetype": "sdist", "filename": "a.tar.gz", "url": "u", "upload_time_iso_8601": "2024-03-01T00:00:00Z"}],
            "0.3.0rc1": [{"packagetype": "sdist", "filename": "b.tar.gz", "url": "u", "upload_time_iso_8601": "2024-04-01T00:00:00Z"}],
            "0.3.0": [{"packagetype": "sdist", "filename": "c.tar.gz", "url": "u", "upload_time_iso_8601": "2024-05-02T10:00:00Z"}],
            "0.0.1": []
        }
    }"#;

    #[test]
    fn test_project_name() {
        assert_eq!(project_name("pypi:Weather_MCP").unwrap(), "weather-mcp");
        assert_eq!(project_name("mcp.server").unwrap(), "mcp-server");
        assert!(project_name("bad name").is_err());
        assert!(project_name("pypi:").is_err());
    }

    #[test]
    fn test_wheel_preferred() {
        let doc: ProjectDocument = serde_json::from_str(DOCUMENT).unwrap();
        let file = select_distribution(&doc.urls).unwrap();
        assert_eq!(file.packagetype, "bdist_wheel");

        let sdist_only: Vec<_> = doc.urls.iter().filter(|f| f.packagetype == "sdist").cloned().collect();
        assert_eq!(
            select_distribution(&sdist_only).unwrap().filename,
            "weather_mcp-0.3.0.tar.gz"
        );
        assert!(select_distribution(&[]).is_none());
    }

    #[test]
    fn test_registry_metadata() {
        let doc: ProjectDocument = serde_json::from_str(DOCUMENT).unwrap();
        let meta = registry_metadata(&doc, select_distribution(&doc.urls));
        assert_eq!(meta.repository.as_deref(), Some("https://github.com/acme/weather-mcp"));
        assert_eq!(meta.author.as_deref(), Some("ops@acme.dev"));
        assert_eq!(meta.readme, None);
        assert_eq!(meta.description.as_deref(), Some("Weather tools"));
        assert!(meta.published_at.is_some());

        let deps: Vec<(&str, DependencyKind)> = meta
            .dependencies
            .iter()
            .map(|d| (d.library_name.as_str(), d.kind))
            .collect();
        assert_eq!(
            deps,
            vec![
                ("mcp", DependencyKind::Runtime),
                ("httpx", DependencyKind::Runtime),
                ("pytest", DependencyKind::Dev),
            ]
        );

        let versions: Vec<&str> = meta.releases.iter().map(|r| r.version.as_str()).collect();
        assert_eq!(versions, vec!["0.3.0", "0.3.0rc1", "0.2.0"]);
        assert!(meta.releases[1].prerelease);
        assert!(!meta.releases[0].prerelease);
    }
}
