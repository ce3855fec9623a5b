//! Durable per-identifier harvest progress.
//!
//! One row per `(source_type, identifier)` in `harvest_checkpoints`. The
//! orchestrator moves a row through
//! `pending → processing → completed | failed | skipped`; `failed →
//! processing` happens on retry, and operators can push any row back to
//! `pending` with [`CheckpointStore::reset_one`].

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::harvest::traits::HarvestError;
use crate::model::{truncate_error, CheckpointRecord, HarvestStatus, SourceType};

const RECORD_COLUMNS: &str =
    "source_type, identifier, status, attempts, last_attempt_at, error_message, locator, updated_at";

/// Number of checkpoints in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub skipped: i64,
}

impl CheckpointCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed + self.skipped
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    pool: SqlitePool,
}

fn record_from_row(row: &SqliteRow) -> Result<CheckpointRecord, HarvestError> {
    let source_type: String = row.try_get("source_type")?;
    let status: String = row.try_get("status")?;
    let decode = |column: &str, reason: String| {
        HarvestError::Storage(sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: reason.into(),
        })
    };

    Ok(CheckpointRecord {
        source_type: source_type
            .parse()
            .map_err(|e| decode("source_type", e))?,
        identifier: row.try_get("identifier")?,
        status: status.parse().map_err(|e| decode("status", e))?,
        attempts: row.try_get("attempts")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        error_message: row.try_get("error_message")?,
        locator: row.try_get("locator")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl CheckpointStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Registers `identifier` as pending. Existing rows are left alone.
    ///
    /// Returns `true` if a new row was created.
    pub async fn enqueue(&self, source: SourceType, identifier: &str) -> Result<bool, HarvestError> {
        let now = Utc::now();
        let inserted = sqlx::query(
            "INSERT INTO harvest_checkpoints (source_type, identifier, status, attempts, created_at, updated_at) \
             VALUES (?, ?, 'pending', 0, ?, ?) \
             ON CONFLICT(source_type, identifier) DO NOTHING",
        )
        .bind(source.as_str())
        .bind(identifier)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;
        Ok(inserted)
    }

    pub async fn get(
        &self,
        source: SourceType,
        identifier: &str,
    ) -> Result<Option<CheckpointRecord>, HarvestError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM harvest_checkpoints WHERE source_type = ? AND identifier = ?",
            RECORD_COLUMNS
        ))
        .bind(source.as_str())
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Starts an attempt: status `processing`, `attempts + 1`,
    /// `last_attempt_at = now`. Creates the row if it does not exist.
    ///
    /// Returns the lifetime attempt count after the increment.
    pub async fn mark_processing(&self, source: SourceType, identifier: &str) -> Result<i64, HarvestError> {
        let now = Utc::now();
        let attempts: i64 = sqlx::query_scalar(
            "INSERT INTO harvest_checkpoints \
                 (source_type, identifier, status, attempts, last_attempt_at, created_at, updated_at) \
             VALUES (?, ?, 'processing', 1, ?, ?, ?) \
             ON CONFLICT(source_type, identifier) DO UPDATE SET \
                 status = 'processing', \
                 attempts = harvest_checkpoints.attempts + 1, \
                 last_attempt_at = excluded.last_attempt_at, \
                 updated_at = excluded.updated_at \
             RETURNING attempts",
        )
        .bind(source.as_str())
        .bind(identifier)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        debug!(source = %source, identifier, attempts, "Checkpoint processing");
        Ok(attempts)
    }

    /// Records success and the locator of the stored entry.
    pub async fn mark_completed(
        &self,
        source: SourceType,
        identifier: &str,
        locator: &str,
    ) -> Result<(), HarvestError> {
        sqlx::query(
            "UPDATE harvest_checkpoints SET status = 'completed', error_message = NULL, \
             locator = ?, updated_at = ? WHERE source_type = ? AND identifier = ?",
        )
        .bind(locator)
        .bind(Utc::now())
        .bind(source.as_str())
        .bind(identifier)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(
        &self,
        source: SourceType,
        identifier: &str,
        error: &str,
    ) -> Result<(), HarvestError> {
        self.finish_with_message(source, identifier, HarvestStatus::Failed, error)
            .await
    }

    /// Marks an identifier whose upstream does not exist.
    pub async fn mark_skipped(
        &self,
        source: SourceType,
        identifier: &str,
        reason: &str,
    ) -> Result<(), HarvestError> {
        self.finish_with_message(source, identifier, HarvestStatus::Skipped, reason)
            .await
    }

    async fn finish_with_message(
        &self,
        source: SourceType,
        identifier: &str,
        status: HarvestStatus,
        message: &str,
    ) -> Result<(), HarvestError> {
        sqlx::query(
            "UPDATE harvest_checkpoints SET status = ?, error_message = ?, updated_at = ? \
             WHERE source_type = ? AND identifier = ?",
        )
        .bind(status.as_str())
        .bind(truncate_error(message))
        .bind(Utc::now())
        .bind(source.as_str())
        .bind(identifier)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_by_status(
        &self,
        source: Option<SourceType>,
        status: HarvestStatus,
    ) -> Result<Vec<CheckpointRecord>, HarvestError> {
        let rows = match source {
            Some(source) => {
                sqlx::query(&format!(
                    "SELECT {} FROM harvest_checkpoints WHERE status = ? AND source_type = ? \
                     ORDER BY created_at, identifier",
                    RECORD_COLUMNS
                ))
                .bind(status.as_str())
                .bind(source.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM harvest_checkpoints WHERE status = ? \
                     ORDER BY created_at, identifier",
                    RECORD_COLUMNS
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(record_from_row).collect()
    }

    /// Pending identifiers in enqueue order.
    pub async fn list_pending(&self, source: Option<SourceType>) -> Result<Vec<CheckpointRecord>, HarvestError> {
        self.list_by_status(source, HarvestStatus::Pending).await
    }

    pub async fn list_failed(&self, source: Option<SourceType>) -> Result<Vec<CheckpointRecord>, HarvestError> {
        self.list_by_status(source, HarvestStatus::Failed).await
    }

    /// Rows stuck in `processing` whose last attempt started more than
    /// `older_than` ago, typically left behind by a crash.
    pub async fn list_stale(&self, older_than: Duration) -> Result<Vec<CheckpointRecord>, HarvestError> {
        let cutoff: DateTime<Utc> = Utc::now() - older_than;
        let rows = sqlx::query(&format!(
            "SELECT {} FROM harvest_checkpoints \
             WHERE status = 'processing' AND last_attempt_at < ? \
             ORDER BY last_attempt_at, identifier",
            RECORD_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Puts one checkpoint back to `pending` with its attempts and error
    /// cleared. Returns `false` if the row does not exist.
    pub async fn reset_one(&self, source: SourceType, identifier: &str) -> Result<bool, HarvestError> {
        let reset = sqlx::query(
            "UPDATE harvest_checkpoints SET status = 'pending', attempts = 0, \
             error_message = NULL, updated_at = ? WHERE source_type = ? AND identifier = ?",
        )
        .bind(Utc::now())
        .bind(source.as_str())
        .bind(identifier)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;

        if reset {
            info!(source = %source, identifier, "Checkpoint reset to pending");
        }
        Ok(reset)
    }

    pub async fn counts(&self) -> Result<CheckpointCounts, HarvestError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM harvest_checkpoints GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = CheckpointCounts::default();
        for (status, count) in rows {
            match status.parse::<HarvestStatus>() {
                Ok(HarvestStatus::Pending) => counts.pending = count,
                Ok(HarvestStatus::Processing) => counts.processing = count,
                Ok(HarvestStatus::Completed) => counts.completed = count,
                Ok(HarvestStatus::Failed) => counts.failed = count,
                Ok(HarvestStatus::Skipped) => counts.skipped = count,
                Err(_) => {}
            }
        }
        Ok(counts)
    }
}
