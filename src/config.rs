//! Harvester configuration.
//!
//! [`HarvesterConfig`] holds every tunable of the crate. It is read from a
//! TOML file where every section and field is optional.
//!
//! # Loading order
//! 1. Environment variables (`HARVESTER_{SECTION}_{FIELD}`, plus `GITHUB_TOKEN`)
//! 2. TOML file
//! 3. Defaults (`Default` impls)
//!
//! ```no_run
//! # async fn example() -> Result<(), catalog_harvester::config::ConfigError> {
//! use catalog_harvester::config::HarvesterConfig;
//!
//! let config = HarvesterConfig::load("harvester.toml").await?;
//! let config = HarvesterConfig::parse("[general]\nlog_level = \"debug\"")?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::analysis::HealthProfile;
use crate::harvest::retry::RetrySettings;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    FileNotFound { path: String },

    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {reason}")]
    ParseFailed { reason: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Top-level configuration, one field per `[section]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvesterConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    /// Orchestrator-level retry of a whole harvest
    #[serde(default = "RetrySettings::orchestrator")]
    pub retry: RetrySettings,
    /// Adapter-level retry of single network calls
    #[serde(default = "RetrySettings::network")]
    pub network_retry: RetrySettings,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            http: HttpConfig::default(),
            archive: ArchiveConfig::default(),
            retry: RetrySettings::orchestrator(),
            network_retry: RetrySettings::network(),
            concurrency: ConcurrencyConfig::default(),
            sources: SourcesConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl HarvesterConfig {
    /// Reads `path`, applies environment overrides and validates.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reads `path` without environment overrides.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(toml_str: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::ParseFailed {
            reason: e.to_string(),
        })
    }

    /// Environment naming: `HARVESTER_{SECTION}_{FIELD}`,
    /// e.g. `HARVESTER_ARCHIVE_MAX_ARCHIVE_BYTES=1048576`.
    pub fn apply_env_overrides(&mut self) {
        // General
        override_string(&mut self.general.log_level, "HARVESTER_GENERAL_LOG_LEVEL");
        override_string(&mut self.general.log_format, "HARVESTER_GENERAL_LOG_FORMAT");
        override_string(&mut self.general.database_url, "HARVESTER_GENERAL_DATABASE_URL");

        // HTTP
        override_u64(
            &mut self.http.connect_timeout_secs,
            "HARVESTER_HTTP_CONNECT_TIMEOUT_SECS",
        );
        override_u64(
            &mut self.http.request_timeout_secs,
            "HARVESTER_HTTP_REQUEST_TIMEOUT_SECS",
        );
        override_string(&mut self.http.user_agent, "HARVESTER_HTTP_USER_AGENT");

        // Archive
        override_u64(
            &mut self.archive.max_archive_bytes,
            "HARVESTER_ARCHIVE_MAX_ARCHIVE_BYTES",
        );
        override_usize(
            &mut self.archive.max_scanned_files,
            "HARVESTER_ARCHIVE_MAX_SCANNED_FILES",
        );

        // Retry
        override_u32(&mut self.retry.max_attempts, "HARVESTER_RETRY_MAX_ATTEMPTS");
        override_u64(&mut self.retry.base_delay_ms, "HARVESTER_RETRY_BASE_DELAY_MS");
        override_u64(&mut self.retry.max_delay_ms, "HARVESTER_RETRY_MAX_DELAY_MS");
        override_u32(
            &mut self.network_retry.max_attempts,
            "HARVESTER_NETWORK_RETRY_MAX_ATTEMPTS",
        );

        // Concurrency
        override_usize(
            &mut self.concurrency.max_concurrent_harvests,
            "HARVESTER_CONCURRENCY_MAX_CONCURRENT_HARVESTS",
        );

        // Sources
        override_opt_string(
            &mut self.sources.github.token,
            "HARVESTER_SOURCES_GITHUB_TOKEN",
        );
        if self.sources.github.token.is_none() {
            override_opt_string(&mut self.sources.github.token, "GITHUB_TOKEN");
        }
        override_csv(
            &mut self.sources.github.official_namespaces,
            "HARVESTER_SOURCES_GITHUB_OFFICIAL_NAMESPACES",
        );
        override_string(
            &mut self.sources.npm.registry_url,
            "HARVESTER_SOURCES_NPM_REGISTRY_URL",
        );
        override_string(
            &mut self.sources.pypi.index_url,
            "HARVESTER_SOURCES_PYPI_INDEX_URL",
        );
        override_string(
            &mut self.sources.container.registry_url,
            "HARVESTER_SOURCES_CONTAINER_REGISTRY_URL",
        );
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.general.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "general.log_level".to_owned(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            });
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.general.log_format.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "general.log_format".to_owned(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            });
        }

        if self.archive.max_archive_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "archive.max_archive_bytes".to_owned(),
                reason: "must be greater than zero".to_owned(),
            });
        }

        for (field, retry) in [("retry", &self.retry), ("network_retry", &self.network_retry)] {
            if retry.max_attempts == 0 {
                return Err(ConfigError::InvalidValue {
                    field: format!("{}.max_attempts", field),
                    reason: "must be at least 1".to_owned(),
                });
            }
            if retry.base_delay_ms > retry.max_delay_ms {
                return Err(ConfigError::InvalidValue {
                    field: format!("{}.base_delay_ms", field),
                    reason: "must not exceed max_delay_ms".to_owned(),
                });
            }
        }

        if self.concurrency.max_concurrent_harvests == 0 {
            return Err(ConfigError::InvalidValue {
                field: "concurrency.max_concurrent_harvests".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        for (field, url) in [
            ("sources.github.api_url", &self.sources.github.api_url),
            ("sources.npm.registry_url", &self.sources.npm.registry_url),
            ("sources.pypi.index_url", &self.sources.pypi.index_url),
            ("sources.container.registry_url", &self.sources.container.registry_url),
            ("sources.container.hub_url", &self.sources.container.hub_url),
        ] {
            if url::Url::parse(url).is_err() {
                return Err(ConfigError::InvalidValue {
                    field: field.to_owned(),
                    reason: format!("'{}' is not a valid URL", url),
                });
            }
        }

        Ok(())
    }
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`
    pub log_level: String,
    /// `json` or `pretty`
    pub log_format: String,
    pub database_url: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "pretty".to_owned(),
            database_url: "sqlite://catalog.db".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub connect_timeout_secs: u64,

    /// Total time for one API exchange; archive downloads are exempt
    pub request_timeout_secs: u64,
    pub user_agent: String,
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            user_agent: format!("catalog-harvester/{}", env!("CARGO_PKG_VERSION")),
            pool_max_idle_per_host: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Ceiling for downloads and cumulative decompressed size
    pub max_archive_bytes: u64,
    /// Source files scanned per package
    pub max_scanned_files: usize,
    /// Larger members are not scanned
    pub max_scanned_file_bytes: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            max_archive_bytes: 500 * 1024 * 1024,
            max_scanned_files: 200,
            max_scanned_file_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub max_concurrent_harvests: usize,
    /// A `processing` checkpoint older than this is reported as stale
    pub stale_after_secs: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_harvests: 8,
            stale_after_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub github: GithubConfig,
    pub npm: NpmConfig,
    pub pypi: PypiConfig,
    pub container: ContainerConfig,
    pub endpoint: EndpointConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubConfig {
    pub api_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Owners whose repositories are treated as verified
    pub official_namespaces: Vec<String>,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com/graphql".to_owned(),
            token: None,
            official_namespaces: vec!["modelcontextprotocol".to_owned()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NpmConfig {
    pub registry_url: String,
    pub downloads_url: String,
}

impl Default for NpmConfig {
    fn default() -> Self {
        Self {
            registry_url: "https://registry.npmjs.org".to_owned(),
            downloads_url: "https://api.npmjs.org/downloads/point/last-month".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PypiConfig {
    pub index_url: String,
}

impl Default for PypiConfig {
    fn default() -> Self {
        Self {
            index_url: "https://pypi.org".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub hub_url: String,
    pub registry_url: String,
    pub default_tag: String,
    pub platform_os: String,
    pub platform_architecture: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            hub_url: "https://hub.docker.com".to_owned(),
            registry_url: "https://registry-1.docker.io".to_owned(),
            default_tag: "latest".to_owned(),
            platform_os: "linux".to_owned(),
            platform_architecture: "amd64".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub probe_timeout_secs: u64,
    /// Applied to each handshake request independently
    pub handshake_timeout_secs: u64,
    pub protocol_version: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            probe_timeout_secs: 10,
            handshake_timeout_secs: 10,
            protocol_version: "2025-03-26".to_owned(),
        }
    }
}

/// Health weights per source. A profile given in the file replaces the
/// built-in one field by field; missing fields fall back to zero weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub source_control: HealthProfile,
    pub registry: HealthProfile,
    pub container: HealthProfile,
    pub endpoint: HealthProfile,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            source_control: HealthProfile::source_control(),
            registry: HealthProfile::registry(),
            container: HealthProfile::container(),
            endpoint: HealthProfile::endpoint(),
        }
    }
}

// --- Environment override helpers ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_opt_string(target: &mut Option<String>, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        if !val.trim().is_empty() {
            *target = Some(val);
        }
    }
}

fn override_usize(target: &mut usize, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<usize>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse usize from env var, ignoring"
            ),
        }
    }
}

fn override_u32(target: &mut u32, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u32>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u32 from env var, ignoring"
            ),
        }
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u64 from env var, ignoring"
            ),
        }
    }
}

fn override_csv(target: &mut Vec<String>, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_has_sane_values() {
        let config = HarvesterConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.archive.max_archive_bytes, 500 * 1024 * 1024);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.network_retry.max_attempts, 3);
        assert_eq!(config.concurrency.max_concurrent_harvests, 8);
        assert_eq!(
            config.sources.github.official_namespaces,
            vec!["modelcontextprotocol"]
        );
        assert_eq!(config.health.container.base, 30.0);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = HarvesterConfig::parse(
            r#"
[general]
log_level = "debug"

[archive]
max_archive_bytes = 1048576

[sources.github]
official_namespaces = ["modelcontextprotocol", "acme"]
"#,
        )
        .unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.general.log_format, "pretty");
        assert_eq!(config.archive.max_archive_bytes, 1_048_576);
        assert_eq!(config.archive.max_scanned_files, 200);
        assert_eq!(config.sources.github.official_namespaces.len(), 2);
        assert_eq!(config.sources.npm.registry_url, "https://registry.npmjs.org");
        assert_eq!(config.retry.base_delay_ms, 2_000);
    }

    #[test]
    fn test_invalid_toml_returns_parse_error() {
        let err = HarvesterConfig::parse("invalid = [[[toml").unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed { .. }));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = HarvesterConfig::default();
        config.general.log_format = "xml".to_owned();
        assert!(config.validate().unwrap_err().to_string().contains("log_format"));

        let mut config = HarvesterConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().unwrap_err().to_string().contains("retry.max_attempts"));

        let mut config = HarvesterConfig::default();
        config.sources.pypi.index_url = "not a url".to_owned();
        assert!(config.validate().unwrap_err().to_string().contains("pypi"));
    }

    #[test]
    fn test_env_override_helpers() {
        let mut text = "original".to_owned();
        std::env::set_var("TEST_HARVESTER_STR", "overridden");
        override_string(&mut text, "TEST_HARVESTER_STR");
        assert_eq!(text, "overridden");
        std::env::remove_var("TEST_HARVESTER_STR");

        let mut number = 8usize;
        std::env::set_var("TEST_HARVESTER_USIZE_BAD", "many");
        override_usize(&mut number, "TEST_HARVESTER_USIZE_BAD");
        assert_eq!(number, 8);
        std::env::remove_var("TEST_HARVESTER_USIZE_BAD");

        let mut list = vec!["a".to_owned()];
        std::env::set_var("TEST_HARVESTER_CSV", "x, y,,z");
        override_csv(&mut list, "TEST_HARVESTER_CSV");
        assert_eq!(list, vec!["x", "y", "z"]);
        std::env::remove_var("TEST_HARVESTER_CSV");

        let mut token = None;
        override_opt_string(&mut token, "TEST_HARVESTER_MISSING_12345");
        assert!(token.is_none());
    }

    #[test]
    fn test_config_serialize_roundtrip() {
        let config = HarvesterConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = HarvesterConfig::parse(&text).unwrap();
        assert_eq!(parsed.general.database_url, config.general.database_url);
        assert_eq!(parsed.health.source_control, config.health.source_control);
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[concurrency]\nmax_concurrent_harvests = 3").unwrap();
        let config = HarvesterConfig::load(file.path()).await.unwrap();
        assert_eq!(config.concurrency.max_concurrent_harvests, 3);
    }

    #[tokio::test]
    async fn test_from_file_not_found() {
        let err = HarvesterConfig::from_file("/nonexistent/harvester.toml")
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }
}
