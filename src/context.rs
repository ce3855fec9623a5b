//! Process-level harvest context.
//!
//! [`HarvestContext`] owns everything adapters share: the configuration,
//! the pooled HTTP clients, one SQLite pool and the two stores on top of it.
//! It is opened once at process start, cloned freely (every field is a
//! handle) and closed explicitly.

use std::sync::Arc;

use reqwest::Client;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

use crate::config::{ConfigError, HarvesterConfig};
use crate::executor::HarvestExecutor;
use crate::harvest::checkpoint::CheckpointStore;
use crate::harvest::http::{build_clients, HttpClients};
use crate::harvest::pipeline::HarvestOrchestrator;
use crate::harvest::retry::RetryPolicy;
use crate::harvest::schema;
use crate::harvest::sources::{build_adapter, SourceKind};
use crate::harvest::store::CatalogStore;
use crate::harvest::traits::HarvestError;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP client setup failed: {0}")]
    Client(#[source] HarvestError),

    #[error("Database setup failed: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Clone)]
pub struct HarvestContext {
    config: Arc<HarvesterConfig>,
    clients: HttpClients,
    pool: SqlitePool,
    catalog: CatalogStore,
    checkpoints: CheckpointStore,
}

impl HarvestContext {
    /// Validates `config`, builds the HTTP clients, connects to
    /// `general.database_url` and creates missing tables.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError`] if any of the three steps fails.
    pub async fn open(config: HarvesterConfig) -> Result<Self, ContextError> {
        config.validate()?;
        let max_connections = u32::try_from(config.concurrency.max_concurrent_harvests)
            .unwrap_or(u32::MAX)
            .saturating_add(1);
        let pool = schema::connect(&config.general.database_url, max_connections).await?;
        Self::with_pool(config, pool).await
    }

    /// Context on a private in-memory database.
    pub async fn in_memory(config: HarvesterConfig) -> Result<Self, ContextError> {
        config.validate()?;
        let pool = schema::connect_in_memory().await?;
        Self::with_pool(config, pool).await
    }

    /// Context on an existing pool. The schema is created if missing.
    pub async fn with_pool(config: HarvesterConfig, pool: SqlitePool) -> Result<Self, ContextError> {
        schema::init_schema(&pool).await?;
        let clients = build_clients(&config.http).map_err(ContextError::Client)?;

        info!(
            database_url = %config.general.database_url,
            max_concurrent_harvests = config.concurrency.max_concurrent_harvests,
            "Harvest context opened"
        );
        Ok(Self {
            config: Arc::new(config),
            clients,
            catalog: CatalogStore::new(pool.clone()),
            checkpoints: CheckpointStore::new(pool.clone()),
            pool,
        })
    }

    pub fn config(&self) -> &HarvesterConfig {
        &self.config
    }

    /// Client for API calls, bounded by `http.request_timeout_secs`.
    pub fn client(&self) -> &Client {
        &self.clients.api
    }

    pub fn clients(&self) -> &HttpClients {
        &self.clients
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Policy adapters use for single network calls.
    pub fn network_policy(&self) -> RetryPolicy {
        RetryPolicy::from_settings(&self.config.network_retry)
    }

    /// Policy the orchestrator uses for whole harvests.
    pub fn orchestrator_policy(&self) -> RetryPolicy {
        RetryPolicy::from_settings(&self.config.retry)
    }

    pub fn orchestrator(&self, kind: SourceKind) -> HarvestOrchestrator {
        HarvestOrchestrator::new(build_adapter(kind, self), self.checkpoints.clone())
            .with_policy(self.orchestrator_policy())
    }

    /// Executor bounded by `concurrency.max_concurrent_harvests`.
    pub fn executor(&self) -> HarvestExecutor {
        HarvestExecutor::new(self.config.concurrency.max_concurrent_harvests)
    }

    /// Closes the database pool. Clones of this context stop working.
    pub async fn close(self) {
        self.pool.close().await;
        info!("Harvest context closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceType;

    #[tokio::test]
    async fn test_in_memory_context_is_usable() {
        let ctx = HarvestContext::in_memory(HarvesterConfig::default()).await.unwrap();
        assert_eq!(ctx.catalog().count().await.unwrap(), 0);
        assert!(ctx.checkpoints().enqueue(SourceType::Npm, "demo").await.unwrap());
        assert_eq!(ctx.network_policy().max_attempts, 3);
        assert_eq!(ctx.orchestrator_policy().max_attempts, 5);
        assert_eq!(
            ctx.orchestrator(SourceKind::Container).adapter().source_type(),
            SourceType::Container
        );
        ctx.close().await;
    }

    #[tokio::test]
    async fn test_open_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HarvesterConfig::default();
        config.general.database_url = format!("sqlite://{}", dir.path().join("catalog.db").display());

        let ctx = HarvestContext::open(config).await.unwrap();
        ctx.catalog()
            .upsert(&crate::harvest::store::tests::sample_entry("npm:demo", 1))
            .await
            .unwrap();
        ctx.close().await;
        assert!(dir.path().join("catalog.db").exists());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = HarvesterConfig::default();
        config.concurrency.max_concurrent_harvests = 0;
        assert!(matches!(
            HarvestContext::in_memory(config).await,
            Err(ContextError::Config(_))
        ));
    }
}
