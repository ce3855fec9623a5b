//! Checkpointed, retrying harvest orchestration.
//!
//! This module provides the [`HarvestOrchestrator`] that drives one
//! [`SourceAdapter`] through its sequential stages (fetch → parse → store)
//! for a single identifier, with:
//! - Durable progress via [`CheckpointStore`]
//! - Whole-sequence retries under an explicit [`RetryPolicy`]
//! - Structured logging via `tracing`, including per-stage durations
//! - Not-found recorded as `skipped` and reported as `Ok(None)`

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, instrument, warn};

use crate::harvest::checkpoint::CheckpointStore;
use crate::harvest::retry::RetryPolicy;
use crate::harvest::traits::{HarvestError, HarvestFailed, SourceAdapter};
use crate::model::{CatalogEntry, HarvestStatus};

// ============================================================================
// Orchestrator
// ============================================================================

/// Harvests identifiers of one source with checkpointing and retries.
///
/// Per attempt the checkpoint moves to `processing` (attempts + 1), then the
/// adapter's `fetch`, `parse` and `store` run in order. Success marks the
/// checkpoint `completed` with the stored locator; a not-found marks it
/// `skipped`; any other failure marks it `failed` with truncated error text
/// and is retried only if the policy's predicate accepts it.
///
/// # Thread Safety
///
/// The orchestrator is `Send + Sync` and is shared by every task of a
/// [`HarvestExecutor`](crate::executor::HarvestExecutor).
pub struct HarvestOrchestrator {
    adapter: Arc<dyn SourceAdapter>,
    checkpoints: CheckpointStore,
    policy: RetryPolicy,
}

impl HarvestOrchestrator {
    /// Creates an orchestrator with the default policy (5 attempts, 2s base
    /// backoff, 30s cap, full jitter).
    pub fn new(adapter: Arc<dyn SourceAdapter>, checkpoints: CheckpointStore) -> Self {
        Self {
            adapter,
            checkpoints,
            policy: RetryPolicy::orchestrator(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn adapter(&self) -> &Arc<dyn SourceAdapter> {
        &self.adapter
    }

    /// Harvests `identifier` unless its checkpoint says there is nothing to do.
    ///
    /// - `completed`: the stored entry is returned without touching the source
    /// - `skipped`: `Ok(None)` without fetching
    ///
    /// # Errors
    ///
    /// Returns [`HarvestFailed`] carrying the last cause once a non-retryable
    /// error occurs or the attempts are exhausted.
    pub async fn harvest(&self, identifier: &str) -> Result<Option<CatalogEntry>, HarvestFailed> {
        self.run(identifier, false).await
    }

    /// Harvests `identifier` regardless of its checkpoint status.
    pub async fn harvest_forced(&self, identifier: &str) -> Result<Option<CatalogEntry>, HarvestFailed> {
        self.run(identifier, true).await
    }

    #[instrument(skip(self), fields(source = %self.adapter.source_type()))]
    async fn run(&self, identifier: &str, forced: bool) -> Result<Option<CatalogEntry>, HarvestFailed> {
        let source = self.adapter.source_type();
        let failed = |attempts: u32, source: HarvestError| HarvestFailed {
            identifier: identifier.to_string(),
            attempts,
            source,
        };

        if !forced {
            let record = self
                .checkpoints
                .get(source, identifier)
                .await
                .map_err(|e| failed(0, e))?;

            if let Some(record) = record {
                match (record.status, record.locator.as_deref()) {
                    (HarvestStatus::Completed, Some(locator)) => {
                        let stored = self
                            .adapter
                            .catalog()
                            .find_by_locator(locator)
                            .await
                            .map_err(|e| failed(0, e))?;
                        if let Some(entry) = stored {
                            info!(identifier, locator, "Already harvested, returning stored entry");
                            return Ok(Some(entry));
                        }
                        warn!(identifier, locator, "Completed checkpoint has no stored entry, re-harvesting");
                    }
                    (HarvestStatus::Skipped, _) => {
                        info!(identifier, "Previously not found, skipping");
                        return Ok(None);
                    }
                    _ => {}
                }
            }
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let lifetime_attempts = self
                .checkpoints
                .mark_processing(source, identifier)
                .await
                .map_err(|e| failed(attempt, e))?;

            match self.attempt(identifier).await {
                Ok(entry) => {
                    self.checkpoints
                        .mark_completed(source, identifier, &entry.locator)
                        .await
                        .map_err(|e| failed(attempt, e))?;
                    info!(
                        identifier,
                        locator = %entry.locator,
                        attempt,
                        lifetime_attempts,
                        risk = %entry.risk_level,
                        health = entry.health_score,
                        "Harvest completed"
                    );
                    return Ok(Some(entry));
                }
                Err(err) if err.is_not_found() => {
                    self.checkpoints
                        .mark_skipped(source, identifier, &err.to_string())
                        .await
                        .map_err(|e| failed(attempt, e))?;
                    info!(identifier, reason = %err, "Source reports not found, checkpoint skipped");
                    return Ok(None);
                }
                Err(err) => {
                    self.checkpoints
                        .mark_failed(source, identifier, &err.to_string())
                        .await
                        .map_err(|e| failed(attempt, e))?;

                    if !self.policy.should_retry(&err, attempt) {
                        warn!(identifier, attempt, error = %err, "Harvest failed");
                        return Err(failed(attempt, err));
                    }

                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        identifier,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient failure, will retry after backoff"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One fetch → parse → store pass.
    async fn attempt(&self, identifier: &str) -> Result<CatalogEntry, HarvestError> {
        let start = Instant::now();

        let raw = self.adapter.fetch(identifier).await?;
        let fetch_ms = start.elapsed().as_millis() as u64;
        let kind = raw.kind();

        let parse_start = Instant::now();
        let entry = self.adapter.parse(raw).await?;
        let parse_ms = parse_start.elapsed().as_millis() as u64;

        let store_start = Instant::now();
        let id = self.adapter.store(&entry).await?;

        info!(
            identifier,
            artifact = kind,
            entry_id = id,
            fetch_ms,
            parse_ms,
            store_ms = store_start.elapsed().as_millis() as u64,
            total_ms = start.elapsed().as_millis() as u64,
            "Stages completed"
        );
        Ok(entry)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::harvest::schema::tests::test_pool;
    use crate::harvest::sources::endpoint::EndpointProbe;
    use crate::harvest::store::tests::sample_entry;
    use crate::harvest::store::CatalogStore;
    use crate::harvest::traits::RawArtifact;
    use crate::model::{SourceType, MAX_ERROR_LEN};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Adapter whose `fetch` fails with scripted errors before succeeding.
    pub(crate) struct MockAdapter {
        catalog: CatalogStore,
        failures: Mutex<VecDeque<HarvestError>>,
        pub(crate) fetches: AtomicU32,
        pub(crate) stores: AtomicU32,
    }

    impl MockAdapter {
        pub(crate) fn new(catalog: CatalogStore, failures: Vec<HarvestError>) -> Self {
            Self {
                catalog,
                failures: Mutex::new(failures.into()),
                fetches: AtomicU32::new(0),
                stores: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl SourceAdapter for MockAdapter {
        fn source_type(&self) -> SourceType {
            SourceType::Npm
        }

        fn locator_for(&self, identifier: &str) -> Result<String, HarvestError> {
            Ok(format!("npm:{}", identifier.trim_start_matches("npm:")))
        }

        fn catalog(&self) -> &CatalogStore {
            &self.catalog
        }

        async fn fetch(&self, identifier: &str) -> Result<RawArtifact, HarvestError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(RawArtifact::Endpoint(Box::new(EndpointProbe {
                url: self.locator_for(identifier)?,
                ..EndpointProbe::default()
            })))
        }

        async fn parse(&self, raw: RawArtifact) -> Result<CatalogEntry, HarvestError> {
            match raw {
                RawArtifact::Endpoint(probe) => Ok(sample_entry(&probe.url, 2)),
                other => Err(HarvestError::MalformedSource(format!(
                    "unexpected artifact {}",
                    other.kind()
                ))),
            }
        }

        async fn store(&self, entry: &CatalogEntry) -> Result<i64, HarvestError> {
            self.stores.fetch_add(1, Ordering::SeqCst);
            self.catalog.upsert(entry).await
        }
    }

    async fn setup(failures: Vec<HarvestError>) -> (Arc<MockAdapter>, HarvestOrchestrator, CheckpointStore) {
        let pool = test_pool().await;
        let adapter = Arc::new(MockAdapter::new(CatalogStore::new(pool.clone()), failures));
        let checkpoints = CheckpointStore::new(pool);
        let orchestrator = HarvestOrchestrator::new(adapter.clone(), checkpoints.clone())
            .with_policy(RetryPolicy::immediate(5));
        (adapter, orchestrator, checkpoints)
    }

    #[tokio::test]
    async fn test_harvest_completes_and_records_locator() {
        let (adapter, orchestrator, checkpoints) = setup(vec![]).await;
        let entry = orchestrator.harvest("demo").await.unwrap().unwrap();
        assert_eq!(entry.locator, "npm:demo");

        let record = checkpoints.get(SourceType::Npm, "demo").await.unwrap().unwrap();
        assert_eq!(record.status, HarvestStatus::Completed);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.locator.as_deref(), Some("npm:demo"));
        assert_eq!(adapter.stores.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_completed_checkpoint_short_circuits() {
        let (adapter, orchestrator, _) = setup(vec![]).await;
        orchestrator.harvest("demo").await.unwrap();
        let again = orchestrator.harvest("demo").await.unwrap().unwrap();

        assert_eq!(again.locator, "npm:demo");
        assert_eq!(again.capabilities.len(), 2);
        assert_eq!(adapter.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.stores.load(Ordering::SeqCst), 1);

        orchestrator.harvest_forced("demo").await.unwrap();
        assert_eq!(adapter.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (adapter, orchestrator, checkpoints) = setup(vec![
            HarvestError::TransientIo("connection reset".to_string()),
            HarvestError::TransientIo("timeout".to_string()),
        ])
        .await;

        let entry = orchestrator.harvest("demo").await.unwrap();
        assert!(entry.is_some());
        assert_eq!(adapter.fetches.load(Ordering::SeqCst), 3);

        let record = checkpoints.get(SourceType::Npm, "demo").await.unwrap().unwrap();
        assert_eq!(record.status, HarvestStatus::Completed);
        assert_eq!(record.attempts, 3);
        assert!(record.error_message.is_none());
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_last_cause() {
        let failures = (0..5)
            .map(|i| HarvestError::TransientIo(format!("reset {}", i)))
            .collect();
        let (adapter, orchestrator, checkpoints) = setup(failures).await;

        let err = orchestrator.harvest("demo").await.unwrap_err();
        assert_eq!(err.attempts, 5);
        assert!(err.source.to_string().contains("reset 4"));
        assert_eq!(adapter.fetches.load(Ordering::SeqCst), 5);
        assert_eq!(adapter.stores.load(Ordering::SeqCst), 0);

        let record = checkpoints.get(SourceType::Npm, "demo").await.unwrap().unwrap();
        assert_eq!(record.status, HarvestStatus::Failed);
        assert_eq!(record.attempts, 5);
    }

    #[tokio::test]
    async fn test_non_transient_failure_is_not_retried() {
        let (adapter, orchestrator, checkpoints) =
            setup(vec![HarvestError::MalformedSource("x".repeat(5000))]).await;

        let err = orchestrator.harvest("demo").await.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(matches!(err.source, HarvestError::MalformedSource(_)));
        assert_eq!(adapter.fetches.load(Ordering::SeqCst), 1);

        let record = checkpoints.get(SourceType::Npm, "demo").await.unwrap().unwrap();
        assert_eq!(record.status, HarvestStatus::Failed);
        assert_eq!(
            record.error_message.unwrap().chars().count(),
            MAX_ERROR_LEN
        );
        assert!(adapter.catalog.find_by_locator("npm:demo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_not_found_is_skipped_not_failed() {
        let (adapter, orchestrator, checkpoints) =
            setup(vec![HarvestError::NotFound("404".to_string())]).await;

        assert!(orchestrator.harvest("ghost").await.unwrap().is_none());
        let record = checkpoints.get(SourceType::Npm, "ghost").await.unwrap().unwrap();
        assert_eq!(record.status, HarvestStatus::Skipped);
        assert_eq!(record.attempts, 1);

        assert!(orchestrator.harvest("ghost").await.unwrap().is_none());
        assert_eq!(adapter.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_checkpoint_retries_on_next_call() {
        let (adapter, orchestrator, checkpoints) =
            setup(vec![HarvestError::AuthRequired("401".to_string())]).await;

        assert!(orchestrator.harvest("demo").await.is_err());
        assert!(orchestrator.harvest("demo").await.unwrap().is_some());
        assert_eq!(adapter.fetches.load(Ordering::SeqCst), 2);

        let record = checkpoints.get(SourceType::Npm, "demo").await.unwrap().unwrap();
        assert_eq!(record.status, HarvestStatus::Completed);
        assert_eq!(record.attempts, 2);
    }
}
