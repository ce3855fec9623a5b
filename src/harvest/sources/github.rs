//! Source-control adapter (GitHub GraphQL API).
//!
//! One POST fetches everything a harvest needs: repository metadata, the
//! texts of `mcp.json`, `package.json`, `pyproject.toml` and `README.md` at
//! `HEAD`, the ten latest releases and up to twenty mentionable users.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::analysis::{HealthProfile, HealthScorer, HealthSignals};
use crate::config::GithubConfig;
use crate::ecosystem::{PackageJsonParser, PyprojectParser};
use crate::harvest::http::send_with_retry;
use crate::harvest::retry::RetryPolicy;
use crate::harvest::sources::{capabilities, risk};
use crate::harvest::store::CatalogStore;
use crate::harvest::traits::{HarvestError, RawArtifact, SourceAdapter};
use crate::model::{CatalogEntry, Contributor, Release, SourceType};
use crate::traits::{EcosystemParser, ManifestSummary};

const REPOSITORY_QUERY: &str = r#"
query($owner: String!, $name: String!) {
  repository(owner: $owner, name: $name) {
    name
    owner { login }
    description
    homepageUrl
    stargazerCount
    forkCount
    pushedAt
    isArchived
    licenseInfo { spdxId name }
    issues(states: OPEN) { totalCount }
    repositoryTopics(first: 20) { nodes { topic { name } } }
    mcpManifest: object(expression: "HEAD:mcp.json") { ... on Blob { text } }
    packageJson: object(expression: "HEAD:package.json") { ... on Blob { text } }
    pyproject: object(expression: "HEAD:pyproject.toml") { ... on Blob { text } }
    readme: object(expression: "HEAD:README.md") { ... on Blob { text } }
    releases(first: 10, orderBy: {field: CREATED_AT, direction: DESC}) {
      nodes { tagName name publishedAt url isPrerelease }
    }
    mentionableUsers(first: 20) { nodes { login } }
  }
}
"#;

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    data: Option<GraphqlData>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlData {
    repository: Option<RepositoryNode>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    #[serde(rename = "type")]
    kind: Option<String>,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryNode {
    name: String,
    owner: LoginNode,
    description: Option<String>,
    homepage_url: Option<String>,
    #[serde(default)]
    stargazer_count: i64,
    #[serde(default)]
    fork_count: i64,
    pushed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    is_archived: bool,
    license_info: Option<LicenseNode>,
    issues: Option<CountNode>,
    repository_topics: Option<Nodes<TopicNode>>,
    mcp_manifest: Option<BlobNode>,
    package_json: Option<BlobNode>,
    pyproject: Option<BlobNode>,
    readme: Option<BlobNode>,
    releases: Option<Nodes<ReleaseNode>>,
    mentionable_users: Option<Nodes<LoginNode>>,
}

#[derive(Debug, Deserialize)]
struct LoginNode {
    login: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LicenseNode {
    spdx_id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountNode {
    total_count: i64,
}

#[derive(Debug, Deserialize)]
struct Nodes<T> {
    #[serde(default = "Vec::new")]
    nodes: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct TopicNode {
    topic: NameNode,
}

#[derive(Debug, Deserialize)]
struct NameNode {
    name: String,
}

#[derive(Debug, Deserialize)]
struct BlobNode {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseNode {
    tag_name: String,
    name: Option<String>,
    published_at: Option<DateTime<Utc>>,
    url: Option<String>,
    #[serde(default)]
    is_prerelease: bool,
}

// ============================================================================
// Snapshot
// ============================================================================

/// Everything one GraphQL round trip returned about a repository.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepositorySnapshot {
    pub owner: String,
    pub name: String,
    pub description: Option<String>,
    pub homepage: Option<String>,
    pub stars: i64,
    pub forks: i64,
    pub open_issues: i64,
    pub license: Option<String>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub archived: bool,
    pub topics: Vec<String>,
    pub mcp_manifest: Option<String>,
    pub package_json: Option<String>,
    pub pyproject: Option<String>,
    pub readme: Option<String>,
    pub releases: Vec<Release>,
    pub contributors: Vec<Contributor>,
}

/// Interprets a GraphQL response body.
///
/// # Errors
///
/// - [`HarvestError::NotFound`] for `repository: null` or a `NOT_FOUND` error
/// - [`HarvestError::TransientIo`] for a `RATE_LIMITED` error
/// - [`HarvestError::MalformedSource`] for any other error without data
pub fn snapshot_from_response(body: &[u8]) -> Result<RepositorySnapshot, HarvestError> {
    let response: GraphqlResponse = serde_json::from_slice(body)?;

    let kinds: Vec<&str> = response
        .errors
        .iter()
        .filter_map(|e| e.kind.as_deref())
        .collect();
    if kinds.contains(&"RATE_LIMITED") {
        return Err(HarvestError::TransientIo(
            "GitHub GraphQL rate limit exhausted".to_string(),
        ));
    }

    let repository = response.data.and_then(|d| d.repository);
    let Some(repo) = repository else {
        let message = response
            .errors
            .first()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "repository is null".to_string());
        return if kinds.contains(&"NOT_FOUND") || response.errors.is_empty() {
            Err(HarvestError::NotFound(message))
        } else {
            Err(HarvestError::MalformedSource(message))
        };
    };

    for error in &response.errors {
        warn!(error = %error.message, "GraphQL partial error");
    }

    let text = |blob: Option<BlobNode>| blob.and_then(|b| b.text);
    Ok(RepositorySnapshot {
        owner: repo.owner.login,
        name: repo.name,
        description: repo.description.filter(|d| !d.trim().is_empty()),
        homepage: repo.homepage_url.filter(|h| !h.trim().is_empty()),
        stars: repo.stargazer_count,
        forks: repo.fork_count,
        open_issues: repo.issues.map(|i| i.total_count).unwrap_or(0),
        license: repo.license_info.and_then(|l| {
            l.spdx_id
                .filter(|id| id != "NOASSERTION")
                .or(l.name)
        }),
        pushed_at: repo.pushed_at,
        archived: repo.is_archived,
        topics: repo
            .repository_topics
            .map(|t| t.nodes.into_iter().map(|n| n.topic.name).collect())
            .unwrap_or_default(),
        mcp_manifest: text(repo.mcp_manifest),
        package_json: text(repo.package_json),
        pyproject: text(repo.pyproject),
        readme: text(repo.readme),
        releases: repo
            .releases
            .map(|r| {
                r.nodes
                    .into_iter()
                    .map(|n| Release {
                        version: n.tag_name,
                        name: n.name,
                        published_at: n.published_at,
                        url: n.url,
                        prerelease: n.is_prerelease,
                    })
                    .collect()
            })
            .unwrap_or_default(),
        contributors: repo
            .mentionable_users
            .map(|u| {
                u.nodes
                    .into_iter()
                    .map(|n| Contributor {
                        login: n.login,
                        contributions: 0,
                    })
                    .collect()
            })
            .unwrap_or_default(),
    })
}

/// Splits `owner/name`, `github:owner/name` or a github.com URL.
pub fn parse_identifier(identifier: &str) -> Result<(String, String), HarvestError> {
    let trimmed = identifier.trim();
    let path = ["github:", "https://github.com/", "http://github.com/", "https://www.github.com/"]
        .iter()
        .find_map(|prefix| trimmed.strip_prefix(prefix))
        .unwrap_or(trimmed);

    let mut segments = path
        .split(['/', '#', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty());
    match (segments.next(), segments.next()) {
        (Some(owner), Some(name)) => {
            let name = name.trim_end_matches(".git");
            if owner.contains(':') || name.is_empty() {
                return Err(HarvestError::MalformedSource(format!(
                    "'{}' is not a GitHub repository",
                    identifier
                )));
            }
            Ok((owner.to_string(), name.to_string()))
        }
        _ => Err(HarvestError::MalformedSource(format!(
            "'{}' is not a GitHub repository (expected owner/name)",
            identifier
        ))),
    }
}

fn locator(owner: &str, name: &str) -> String {
    format!("https://github.com/{}/{}", owner, name).to_lowercase()
}

/// Builds and scores the entry for a snapshot.
///
/// A broken `mcp.json` or descriptor is logged and leaves the entry without
/// capabilities or dependencies; it never fails the parse.
pub fn build_entry(
    snapshot: &RepositorySnapshot,
    official_namespaces: &[String],
    scorer: &HealthScorer,
    now: DateTime<Utc>,
) -> CatalogEntry {
    let locator = locator(&snapshot.owner, &snapshot.name);
    let mut entry = CatalogEntry::new(&locator, SourceType::SourceControl, &snapshot.name);
    entry.description = snapshot.description.clone();
    entry.author = Some(snapshot.owner.clone());
    entry.license = snapshot.license.clone();
    entry.homepage = snapshot.homepage.clone();
    entry.repository_url = Some(locator.clone());
    entry.stars = snapshot.stars;
    entry.forks = snapshot.forks;
    entry.open_issues = snapshot.open_issues;
    entry.last_activity_at = snapshot.pushed_at;
    entry.harvested_at = now;
    entry.releases = snapshot.releases.clone();
    entry.contributors = snapshot.contributors.clone();
    entry.version = snapshot
        .releases
        .iter()
        .find(|r| !r.prerelease)
        .map(|r| r.version.clone());

    if let Some(manifest) = &snapshot.mcp_manifest {
        match capabilities::from_manifest_bytes(manifest.as_bytes()) {
            Ok(caps) => entry.capabilities = caps,
            Err(e) => warn!(locator = %locator, error = %e, "Unreadable mcp.json, no capabilities"),
        }
    }

    let summary = descriptor_summary(snapshot, &locator);
    if let Some((descriptor, summary)) = &summary {
        entry.dependencies = summary.dependencies.clone();
        entry
            .metadata
            .insert("descriptor".to_string(), json!(descriptor));
    }

    entry.metadata.insert("topics".to_string(), json!(snapshot.topics));
    entry
        .metadata
        .insert("archived".to_string(), json!(snapshot.archived));

    let official = risk::is_official_owner(&locator, official_namespaces);
    entry.verified = official;
    entry.risk_level = risk::assess(&entry, official_namespaces);

    let signals = HealthSignals {
        stars: snapshot.stars,
        forks: snapshot.forks,
        open_issues: snapshot.open_issues,
        has_readme: snapshot.readme.as_deref().is_some_and(|r| !r.trim().is_empty()),
        has_description: entry.description.is_some(),
        has_license: entry.license.is_some(),
        has_linked_repository: true,
        has_tests: summary.as_ref().is_some_and(|(_, s)| s.has_tests),
        capability_count: entry.capabilities.len(),
        ..HealthSignals::default()
    }
    .with_activity(snapshot.pushed_at, now);
    entry.health_score = scorer.score(&signals);

    entry
}

/// `package.json` if present and readable, else `pyproject.toml`.
fn descriptor_summary(
    snapshot: &RepositorySnapshot,
    locator: &str,
) -> Option<(&'static str, ManifestSummary)> {
    let candidates: [(&'static str, Option<&String>, &dyn EcosystemParser); 2] = [
        ("package.json", snapshot.package_json.as_ref(), &PackageJsonParser),
        ("pyproject.toml", snapshot.pyproject.as_ref(), &PyprojectParser),
    ];
    for (descriptor, text, parser) in candidates {
        let Some(text) = text else {
            continue;
        };
        match parser.parse(text.as_bytes()) {
            Ok(summary) => return Some((descriptor, summary)),
            Err(e) => warn!(locator, descriptor, error = %e, "Unreadable descriptor, skipping"),
        }
    }
    None
}

// ============================================================================
// Adapter
// ============================================================================

pub struct GithubAdapter {
    client: Client,
    catalog: CatalogStore,
    policy: RetryPolicy,
    config: GithubConfig,
    scorer: HealthScorer,
}

impl GithubAdapter {
    pub fn new(
        client: Client,
        catalog: CatalogStore,
        policy: RetryPolicy,
        config: GithubConfig,
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
}

#[async_trait]
impl SourceAdapter for GithubAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::SourceControl
    }

    fn locator_for(&self, identifier: &str) -> Result<String, HarvestError> {
        let (owner, name) = parse_identifier(identifier)?;
        Ok(locator(&owner, &name))
    }

    fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    #[instrument(skip(self), fields(source = "github"))]
    async fn fetch(&self, identifier: &str) -> Result<RawArtifact, HarvestError> {
        let token = self
            .config
            .token
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                HarvestError::AuthRequired(
                    "GitHub token missing (sources.github.token or GITHUB_TOKEN)".to_string(),
                )
            })?;
        let (owner, name) = parse_identifier(identifier)?;
        let payload = json!({
            "query": REPOSITORY_QUERY,
            "variables": { "owner": owner, "name": name },
        });

        let response = send_with_retry(&self.policy, "GitHub GraphQL", || {
            self.client
                .post(&self.config.api_url)
                .bearer_auth(token)
                .json(&payload)
        })
        .await?;
        let body = response.bytes().await?;
        let snapshot = snapshot_from_response(&body)?;

        debug!(
            owner = %snapshot.owner,
            name = %snapshot.name,
            releases = snapshot.releases.len(),
            has_manifest = snapshot.mcp_manifest.is_some(),
            "Repository fetched"
        );
        Ok(RawArtifact::SourceControl(Box::new(snapshot)))
    }

    async fn parse(&self, raw: RawArtifact) -> Result<CatalogEntry, HarvestError> {
        match raw {
            RawArtifact::SourceControl(snapshot) => Ok(build_entry(
                &snapshot,
                &self.config.official_namespaces,
                &self.scorer,
                Utc::now(),
            )),
            other => Err(HarvestError::MalformedSource(format!(
                "GitHub adapter cannot parse a {} artifact",
                other.kind()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RiskLevel;
    use chrono::Duration;

    fn official() -> Vec<String> {
        vec!["modelcontextprotocol".to_string()]
    }

    #[test]
    fn test_parse_identifier_forms() {
        let expected = ("acme".to_string(), "weather".to_string());
        assert_eq!(parse_identifier("acme/weather").unwrap(), expected);
        assert_eq!(parse_identifier("github:acme/weather").unwrap(), expected);
        assert_eq!(
            parse_identifier("https://github.com/acme/weather.git").unwrap(),
            expected
        );
        assert_eq!(
            parse_identifier("https://github.com/acme/weather/tree/main").unwrap(),
            expected
        );
        assert!(parse_identifier("weather").is_err());
        assert_eq!(
            locator("Acme", "Weather"),
            "https://github.com/acme/weather"
        );
    }

    #[test]
    fn test_response_not_found() {
        let body = br#"{"data":{"repository":null},"errors":[{"type":"NOT_FOUND","message":"Could not resolve to a Repository"}]}"#;
        assert!(matches!(
            snapshot_from_response(body),
            Err(HarvestError::NotFound(_))
        ));

        let body = br#"{"errors":[{"type":"RATE_LIMITED","message":"API rate limit exceeded"}]}"#;
        assert!(snapshot_from_response(body).unwrap_err().is_transient());
    }

    #[test]
    fn test_response_maps_fields() {
        let body = br##"{"data":{"repository":{
            "name":"servers","owner":{"login":"modelcontextprotocol"},
            "description":"Reference servers","homepageUrl":"",
            "stargazerCount":1200,"forkCount":80,"pushedAt":"2024-05-01T10:00:00Z",
            "isArchived":false,
            "licenseInfo":{"spdxId":"MIT","name":"MIT License"},
            "issues":{"totalCount":4},
            "repositoryTopics":{"nodes":[{"topic":{"name":"mcp"}}]},
            "mcpManifest":{"text":"{\"tools\":[\"a\"]}"},
            "packageJson":null,"pyproject":null,"readme":{"text":"# Servers"},
            "releases":{"nodes":[{"tagName":"v1.0.0","name":"One","publishedAt":"2024-04-01T00:00:00Z","url":"https://github.com/x","isPrerelease":false}]},
            "mentionableUsers":{"nodes":[{"login":"octocat"}]}
        }}}"##;
        let snapshot = snapshot_from_response(body).unwrap();
        assert_eq!(snapshot.stars, 1200);
        assert_eq!(snapshot.open_issues, 4);
        assert_eq!(snapshot.license.as_deref(), Some("MIT"));
        assert!(snapshot.homepage.is_none());
        assert_eq!(snapshot.topics, vec!["mcp"]);
        assert_eq!(snapshot.releases[0].version, "v1.0.0");
        assert_eq!(snapshot.contributors[0].login, "octocat");
    }

    fn official_snapshot(now: DateTime<Utc>) -> RepositorySnapshot {
        RepositorySnapshot {
            owner: "modelcontextprotocol".to_string(),
            name: "servers".to_string(),
            description: Some("Reference servers".to_string()),
            stars: 1200,
            license: Some("MIT".to_string()),
            pushed_at: Some(now - Duration::days(2)),
            readme: Some("# Servers".to_string()),
            mcp_manifest: Some(
                r#"{"tools":[{"name":"read_file"},{"name":"list_dir"},{"name":"search"}]}"#
                    .to_string(),
            ),
            package_json: Some(
                r#"{"name":"servers","dependencies":{"@modelcontextprotocol/sdk":"^1.0.0"},"scripts":{"test":"jest"}}"#
                    .to_string(),
            ),
            ..RepositorySnapshot::default()
        }
    }

    #[test]
    fn test_official_repository_is_verified_and_healthy() {
        let now = Utc::now();
        let scorer = HealthScorer::new(HealthProfile::source_control());
        let entry = build_entry(&official_snapshot(now), &official(), &scorer, now);

        assert_eq!(entry.capabilities.len(), 3);
        assert!(entry.verified);
        assert_eq!(entry.risk_level, RiskLevel::Safe);
        assert!(
            (85..=100).contains(&entry.health_score),
            "health {}",
            entry.health_score
        );
        assert_eq!(entry.dependencies.len(), 1);
        assert_eq!(entry.metadata["descriptor"], "package.json");
    }

    #[test]
    fn test_unofficial_dangerous_dependency_is_high() {
        let now = Utc::now();
        let scorer = HealthScorer::new(HealthProfile::source_control());
        let mut snapshot = official_snapshot(now);
        snapshot.owner = "someone".to_string();
        snapshot.package_json = Some(r#"{"dependencies":{"shelljs":"^0.8"}}"#.to_string());

        let entry = build_entry(&snapshot, &official(), &scorer, now);
        assert!(!entry.verified);
        assert_eq!(entry.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_broken_manifest_degrades() {
        let now = Utc::now();
        let scorer = HealthScorer::new(HealthProfile::source_control());
        let mut snapshot = official_snapshot(now);
        snapshot.mcp_manifest = Some("{broken".to_string());
        snapshot.package_json = Some("also broken".to_string());
        snapshot.pyproject = Some("[project]\nname = \"servers\"\ndependencies = [\"httpx>=0.27\"]\n".to_string());

        let entry = build_entry(&snapshot, &official(), &scorer, now);
        assert!(entry.capabilities.is_empty());
        assert_eq!(entry.dependencies[0].library_name, "httpx");
        assert_eq!(entry.metadata["descriptor"], "pyproject.toml");
    }
}
