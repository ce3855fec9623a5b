//! Concurrent harvesting of many identifiers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{error, info, instrument};

use crate::context::HarvestContext;
use crate::harvest::pipeline::HarvestOrchestrator;
use crate::harvest::sources::SourceKind;
use crate::harvest::traits::HarvestFailed;

/// What happened to each identifier of a batch, in input order.
#[derive(Debug, Default)]
pub struct HarvestReport {
    /// Locators of stored (or already stored) entries
    pub harvested: Vec<String>,
    pub not_found: Vec<String>,
    pub failed: Vec<HarvestFailed>,

    /// Identifiers whose task panicked or was cancelled
    pub aborted: Vec<String>,
}

impl HarvestReport {
    pub fn total(&self) -> usize {
        self.harvested.len() + self.not_found.len() + self.failed.len() + self.aborted.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.aborted.is_empty()
    }
}

/// Runs harvests on tokio tasks, at most `concurrency_limit` at a time.
///
/// Identifiers are deduplicated by canonical locator first, so `npm:foo`
/// and `foo` routed to npm run once.
pub struct HarvestExecutor {
    semaphore: Arc<Semaphore>,
}

impl HarvestExecutor {
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency_limit.max(1))),
        }
    }

    /// Harvests every identifier with one orchestrator.
    #[instrument(skip(self, orchestrator, identifiers), fields(count = identifiers.len()))]
    pub async fn run(&self, orchestrator: Arc<HarvestOrchestrator>, identifiers: Vec<String>) -> HarvestReport {
        let jobs = identifiers
            .into_iter()
            .map(|id| (orchestrator.clone(), id))
            .collect();
        self.run_jobs(distinct(jobs)).await
    }

    /// Harvests identifiers of mixed sources, each routed by
    /// [`SourceKind::detect`]. One orchestrator is built per kind.
    #[instrument(skip(self, ctx, identifiers), fields(count = identifiers.len()))]
    pub async fn run_detected(&self, ctx: &HarvestContext, identifiers: Vec<String>) -> HarvestReport {
        let mut orchestrators: HashMap<SourceKind, Arc<HarvestOrchestrator>> = HashMap::new();
        let jobs = identifiers
            .into_iter()
            .map(|id| {
                let kind = SourceKind::detect(id.trim());
                let orchestrator = orchestrators
                    .entry(kind)
                    .or_insert_with(|| Arc::new(ctx.orchestrator(kind)))
                    .clone();
                (orchestrator, id)
            })
            .collect();
        self.run_jobs(distinct(jobs)).await
    }

    async fn run_jobs(&self, jobs: Vec<Job>) -> HarvestReport {
        let mut handles = Vec::with_capacity(jobs.len());
        for (orchestrator, identifier) in jobs {
            let semaphore = self.semaphore.clone();
            let task_identifier = identifier.clone();
            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                Some(orchestrator.harvest(&task_identifier).await)
            });
            handles.push((identifier, handle));
        }

        let mut report = HarvestReport::default();
        for (identifier, handle) in handles {
            match handle.await {
                Ok(Some(Ok(Some(entry)))) => report.harvested.push(entry.locator),
                Ok(Some(Ok(None))) => report.not_found.push(identifier),
                Ok(Some(Err(failed))) => report.failed.push(failed),
                Ok(None) => report.aborted.push(identifier),
                Err(e) => {
                    error!(identifier = %identifier, error = %e, "Harvest task aborted");
                    report.aborted.push(identifier);
                }
            }
        }

        info!(
            harvested = report.harvested.len(),
            not_found = report.not_found.len(),
            failed = report.failed.len(),
            aborted = report.aborted.len(),
            "Batch finished"
        );
        report
    }
}

type Job = (Arc<HarvestOrchestrator>, String);

/// Trims identifiers, drops empty ones and keeps the first job per
/// `(source, locator)`. An identifier the adapter cannot turn into a
/// locator is keyed by itself so its harvest still runs and reports
/// the failure.
fn distinct(jobs: Vec<Job>) -> Vec<Job> {
    let mut seen = HashSet::new();
    jobs.into_iter()
        .map(|(orchestrator, id)| (orchestrator, id.trim().to_string()))
        .filter(|(orchestrator, id)| {
            if id.is_empty() {
                return false;
            }
            let adapter = orchestrator.adapter();
            let locator = adapter.locator_for(id).unwrap_or_else(|_| id.clone());
            seen.insert((adapter.source_type(), locator))
        })
        .collect()
}
