//! Bulk jobs over stored state.
//!
//! - [`recompute_risk`] replays the risk assessment of every stored entry,
//!   e.g. after the denylists or official namespaces change
//! - [`prune`] deletes entries not harvested within a maximum age
//! - [`requeue_stale`] puts checkpoints stuck in `processing` back to
//!   `pending`

use chrono::{Duration, Utc};
use tracing::{debug, info, instrument};

use crate::harvest::checkpoint::CheckpointStore;
use crate::harvest::sources::risk;
use crate::harvest::store::CatalogStore;
use crate::harvest::traits::HarvestError;
use crate::model::SourceType;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RiskRecomputation {
    pub examined: usize,
    pub changed: usize,
}

/// Reassesses stored entries and writes back only levels that changed.
///
/// # Errors
///
/// Stops at the first storage error; levels written before it stay written.
#[instrument(skip(catalog, official_namespaces))]
pub async fn recompute_risk(
    catalog: &CatalogStore,
    official_namespaces: &[String],
    source: Option<SourceType>,
) -> Result<RiskRecomputation, HarvestError> {
    let mut summary = RiskRecomputation::default();
    for entry in catalog.list_entries(source).await? {
        summary.examined += 1;
        let level = risk::assess(&entry, official_namespaces);
        if level != entry.risk_level {
            debug!(locator = %entry.locator, from = %entry.risk_level, to = %level, "Risk level changed");
            if catalog.update_risk(&entry.locator, level).await? {
                summary.changed += 1;
            }
        }
    }

    info!(examined = summary.examined, changed = summary.changed, "Risk recomputed");
    Ok(summary)
}

/// Deletes entries harvested more than `max_age` ago.
pub async fn prune(catalog: &CatalogStore, max_age: Duration) -> Result<u64, HarvestError> {
    catalog.prune_older_than(Utc::now() - max_age).await
}

/// Resets `processing` checkpoints older than `older_than` to `pending`.
/// Returns how many were reset.
pub async fn requeue_stale(checkpoints: &CheckpointStore, older_than: Duration) -> Result<usize, HarvestError> {
    let mut requeued = 0;
    for record in checkpoints.list_stale(older_than).await? {
        if checkpoints.reset_one(record.source_type, &record.identifier).await? {
            requeued += 1;
        }
    }
    if requeued > 0 {
        info!(requeued, "Stale checkpoints requeued");
    }
    Ok(requeued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::schema::tests::test_pool;
    use crate::harvest::store::tests::sample_entry;
    use crate::model::{HarvestStatus, RiskLevel};

    #[tokio::test]
    async fn test_recompute_risk_writes_changes_only() {
        let catalog = CatalogStore::new(test_pool().await);

        // No linked repository: the ghost floor lifts it to high.
        catalog.upsert(&sample_entry("npm:ghost", 1)).await.unwrap();

        let mut linked = sample_entry("npm:linked", 1);
        linked.repository_url = Some("https://github.com/acme/linked".to_string());
        linked.risk_level = RiskLevel::Safe;
        catalog.upsert(&linked).await.unwrap();

        let summary = recompute_risk(&catalog, &[], None).await.unwrap();
        assert_eq!(summary, RiskRecomputation { examined: 2, changed: 1 });

        let ghost = catalog.find_by_locator("npm:ghost").await.unwrap().unwrap();
        assert_eq!(ghost.risk_level, RiskLevel::High);

        let again = recompute_risk(&catalog, &[], Some(SourceType::Npm)).await.unwrap();
        assert_eq!(again.changed, 0);
    }

    #[tokio::test]
    async fn test_prune_by_age() {
        let catalog = CatalogStore::new(test_pool().await);
        let mut old = sample_entry("npm:old", 1);
        old.harvested_at = Utc::now() - Duration::days(40);
        catalog.upsert(&old).await.unwrap();
        catalog.upsert(&sample_entry("npm:fresh", 1)).await.unwrap();

        assert_eq!(prune(&catalog, Duration::days(30)).await.unwrap(), 1);
        assert_eq!(catalog.list_locators(None).await.unwrap(), vec!["npm:fresh"]);
    }

    #[tokio::test]
    async fn test_requeue_stale() {
        let checkpoints = CheckpointStore::new(test_pool().await);
        checkpoints.mark_processing(SourceType::Pypi, "demo").await.unwrap();

        assert_eq!(requeue_stale(&checkpoints, Duration::hours(1)).await.unwrap(), 0);
        // A negative age puts the cutoff in the future.
        assert_eq!(requeue_stale(&checkpoints, Duration::seconds(-1)).await.unwrap(), 1);

        let record = checkpoints.get(SourceType::Pypi, "demo").await.unwrap().unwrap();
        assert_eq!(record.status, HarvestStatus::Pending);
        assert_eq!(record.attempts, 0);
    }
}
