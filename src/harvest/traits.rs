//! Core traits and error types for the harvest system.
//!
//! This module defines the seams the orchestrator depends on:
//! - The per-source strategy interface via [`SourceAdapter`]
//! - The raw, source-specific payload handed from `fetch` to `parse` via
//!   [`RawArtifact`]
//! - The error taxonomy via [`HarvestError`] and its retry predicate
//! - The single error surfaced to callers via [`HarvestFailed`]

use async_trait::async_trait;
use thiserror::Error;

use crate::harvest::archive::ArchiveError;
use crate::harvest::sources::container::ContainerArtifact;
use crate::harvest::sources::endpoint::EndpointProbe;
use crate::harvest::sources::github::RepositorySnapshot;
use crate::harvest::sources::registry::RegistryArtifact;
use crate::harvest::store::CatalogStore;
use crate::model::{CatalogEntry, SourceType};
use crate::traits::ParseError;

// ============================================================================
// Source Adapter Trait
// ============================================================================

/// What `fetch` retrieved, before any interpretation.
#[derive(Debug, Clone)]
pub enum RawArtifact {
    SourceControl(Box<RepositorySnapshot>),
    Registry(Box<RegistryArtifact>),
    Container(Box<ContainerArtifact>),
    Endpoint(Box<EndpointProbe>),
}

impl RawArtifact {
    pub fn kind(&self) -> &'static str {
        match self {
            RawArtifact::SourceControl(_) => "source_control",
            RawArtifact::Registry(_) => "registry",
            RawArtifact::Container(_) => "container",
            RawArtifact::Endpoint(_) => "endpoint",
        }
    }
}

/// One acquisition strategy: fetch raw data, parse it into a
/// [`CatalogEntry`], store the entry.
///
/// The orchestrator calls the three steps in sequence and depends on nothing
/// else. `fetch` is the only step expected to touch the network, except for
/// the endpoint adapter whose `parse` performs a bounded introspection
/// handshake.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: one adapter instance is shared by
/// every concurrent harvest for its source.
///
/// # Errors
///
/// Every step returns [`HarvestError`]. Only [`HarvestError::TransientIo`]
/// (and transient storage errors) are retried by the orchestrator;
/// [`HarvestError::NotFound`] is recorded once and never retried.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_type(&self) -> SourceType;

    /// Canonical locator for `identifier`, the unique key of the stored entry.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::MalformedSource`] if the identifier cannot
    /// name anything in this source.
    fn locator_for(&self, identifier: &str) -> Result<String, HarvestError>;

    /// Store used by the default [`store`](SourceAdapter::store).
    fn catalog(&self) -> &CatalogStore;

    async fn fetch(&self, identifier: &str) -> Result<RawArtifact, HarvestError>;

    async fn parse(&self, raw: RawArtifact) -> Result<CatalogEntry, HarvestError>;

    /// Full-replace upsert keyed by the entry's locator. Returns the row id.
    async fn store(&self, entry: &CatalogEntry) -> Result<i64, HarvestError> {
        self.catalog().upsert(entry).await
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Failure kinds shared by every adapter.
#[derive(Error, Debug)]
pub enum HarvestError {
    /// Network failure, timeout, throttling or upstream 5xx (retryable)
    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    /// Unreadable primary manifest or response body (not retryable)
    #[error("Malformed source data: {0}")]
    MalformedSource(String),

    /// Archive ceiling exceeded (fatal)
    #[error("Unsafe archive: {0}")]
    UnsafeArchive(String),

    /// Missing or rejected credentials (fatal)
    #[error("Authentication required: {0}")]
    AuthRequired(String),

    /// The source does not know this identifier (terminal)
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

impl HarvestError {
    /// Retry predicate shared by both retry layers.
    pub fn is_transient(&self) -> bool {
        match self {
            HarvestError::TransientIo(_) => true,
            HarvestError::Storage(e) => is_transient_storage(e),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, HarvestError::NotFound(_))
    }
}

/// Lock contention and pool exhaustion clear up on their own.
fn is_transient_storage(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            let message = db.message();
            message.contains("database is locked") || message.contains("database is busy")
        }
        _ => false,
    }
}

impl From<ArchiveError> for HarvestError {
    fn from(e: ArchiveError) -> Self {
        match e {
            ArchiveError::CeilingExceeded { .. } => HarvestError::UnsafeArchive(e.to_string()),
            ArchiveError::UnsupportedFormat | ArchiveError::Corrupt(_) => {
                HarvestError::MalformedSource(e.to_string())
            }
        }
    }
}

impl From<ParseError> for HarvestError {
    fn from(e: ParseError) -> Self {
        HarvestError::MalformedSource(e.to_string())
    }
}

impl From<serde_json::Error> for HarvestError {
    fn from(e: serde_json::Error) -> Self {
        HarvestError::MalformedSource(format!("JSON error: {}", e))
    }
}

impl From<reqwest::Error> for HarvestError {
    fn from(e: reqwest::Error) -> Self {
        // Builder errors (bad URL, bad header) are ours and never heal.
        if e.is_decode() || e.is_builder() {
            HarvestError::MalformedSource(e.to_string())
        } else if let Some(status) = e.status() {
            crate::harvest::http::classify_status(status, &e.to_string())
        } else {
            HarvestError::TransientIo(e.to_string())
        }
    }
}

/// The single error kind surfaced by the orchestrator.
///
/// Carries the original cause; not-found is never reported through this
/// type (it is `Ok(None)`).
#[derive(Error, Debug)]
#[error("Harvest of '{identifier}' failed after {attempts} attempt(s): {source}")]
pub struct HarvestFailed {
    pub identifier: String,
    pub attempts: u32,
    #[source]
    pub source: HarvestError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_predicate() {
        assert!(HarvestError::TransientIo("reset".into()).is_transient());
        assert!(HarvestError::Storage(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!HarvestError::Storage(sqlx::Error::RowNotFound).is_transient());
        assert!(!HarvestError::NotFound("x".into()).is_transient());
        assert!(!HarvestError::AuthRequired("x".into()).is_transient());
        assert!(!HarvestError::UnsafeArchive("x".into()).is_transient());
    }

    #[test]
    fn test_request_builder_error_is_not_retried() {
        let err = reqwest::Client::new().get("not a url").build().unwrap_err();
        assert!(err.is_builder());
        let err = HarvestError::from(err);
        assert!(matches!(err, HarvestError::MalformedSource(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_archive_error_mapping() {
        let ceiling: HarvestError = ArchiveError::CeilingExceeded {
            ceiling: 10,
            attempted: 11,
        }
        .into();
        assert!(matches!(ceiling, HarvestError::UnsafeArchive(_)));

        let format: HarvestError = ArchiveError::UnsupportedFormat.into();
        assert!(matches!(format, HarvestError::MalformedSource(_)));
    }

    #[test]
    fn test_harvest_failed_keeps_cause() {
        let failed = HarvestFailed {
            identifier: "npm:demo".to_string(),
            attempts: 5,
            source: HarvestError::TransientIo("timeout".to_string()),
        };
        let message = failed.to_string();
        assert!(message.contains("npm:demo"));
        assert!(message.contains("5 attempt"));
        assert!(std::error::Error::source(&failed).is_some());
    }
}
