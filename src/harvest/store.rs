//! Catalog persistence.
//!
//! [`CatalogStore::upsert`] is a full-replace upsert keyed by locator: inside
//! one transaction the entry row is updated (or inserted), every child row is
//! deleted by `entry_id`, and the new children are bulk-inserted. A failed
//! step drops the transaction, so no partial entry is ever committed.
//!
//! Writes to the same locator are serialized by an in-process mutex per
//! locator, so two concurrent harvests cannot interleave their
//! delete/insert sequences.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::harvest::traits::HarvestError;
use crate::model::{
    Capability, CapabilityKind, CatalogEntry, Contributor, Dependency, DependencyKind, Release,
    RiskLevel, SourceType,
};

const CHILD_TABLES: &[&str] = &[
    "entry_capabilities",
    "entry_dependencies",
    "entry_releases",
    "entry_contributors",
];

const ENTRY_COLUMNS: &str = "id, locator, source_type, name, description, version, author, \
     license, homepage, repository_url, stars, forks, downloads, open_issues, risk_level, \
     verified, health_score, last_activity_at, harvested_at, metadata";

/// Transactional access to catalog entries.
///
/// Cloning is cheap: clones share the pool and the per-locator lock table.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

fn decode_error(column: &str, reason: String) -> HarvestError {
    HarvestError::Storage(sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: reason.into(),
    })
}

fn parse_column<T: FromStr<Err = String>>(column: &str, raw: &str) -> Result<T, HarvestError> {
    raw.parse::<T>().map_err(|e| decode_error(column, e))
}

impl CatalogStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn lock_for(&self, locator: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(locator.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drops the lock entry once nobody else holds or waits on it.
    fn release_lock(&self, locator: &str) {
        self.locks
            .remove_if(locator, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Inserts or fully replaces `entry`. Returns the row id.
    ///
    /// # Errors
    ///
    /// Returns [`HarvestError::Storage`] if any statement fails; the
    /// transaction is rolled back and the stored entry is unchanged.
    pub async fn upsert(&self, entry: &CatalogEntry) -> Result<i64, HarvestError> {
        let result = {
            let lock = self.lock_for(&entry.locator);
            let _guard = lock.lock().await;
            self.upsert_locked(entry).await
        };
        self.release_lock(&entry.locator);
        result
    }

    async fn upsert_locked(&self, entry: &CatalogEntry) -> Result<i64, HarvestError> {
        let metadata = serde_json::to_string(&entry.metadata)?;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM catalog_entries WHERE locator = ?")
                .bind(&entry.locator)
                .fetch_optional(&mut *tx)
                .await?;

        let id = match existing {
            Some(id) => {
                sqlx::query(
                    r#"
                    UPDATE catalog_entries SET
                        source_type = ?, name = ?, description = ?, version = ?, author = ?,
                        license = ?, homepage = ?, repository_url = ?, stars = ?, forks = ?,
                        downloads = ?, open_issues = ?, risk_level = ?, verified = ?,
                        health_score = ?, last_activity_at = ?, harvested_at = ?, metadata = ?,
                        updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(entry.source_type.as_str())
                .bind(&entry.name)
                .bind(&entry.description)
                .bind(&entry.version)
                .bind(&entry.author)
                .bind(&entry.license)
                .bind(&entry.homepage)
                .bind(&entry.repository_url)
                .bind(entry.stars)
                .bind(entry.forks)
                .bind(entry.downloads)
                .bind(entry.open_issues)
                .bind(entry.risk_level.as_str())
                .bind(entry.verified)
                .bind(i64::from(entry.health_score))
                .bind(entry.last_activity_at)
                .bind(entry.harvested_at)
                .bind(&metadata)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;

                for table in CHILD_TABLES {
                    sqlx::query(&format!("DELETE FROM {} WHERE entry_id = ?", table))
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
                id
            }
            None => sqlx::query(
                r#"
                INSERT INTO catalog_entries (
                    locator, source_type, name, description, version, author, license,
                    homepage, repository_url, stars, forks, downloads, open_issues,
                    risk_level, verified, health_score, last_activity_at, harvested_at,
                    metadata, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&entry.locator)
            .bind(entry.source_type.as_str())
            .bind(&entry.name)
            .bind(&entry.description)
            .bind(&entry.version)
            .bind(&entry.author)
            .bind(&entry.license)
            .bind(&entry.homepage)
            .bind(&entry.repository_url)
            .bind(entry.stars)
            .bind(entry.forks)
            .bind(entry.downloads)
            .bind(entry.open_issues)
            .bind(entry.risk_level.as_str())
            .bind(entry.verified)
            .bind(i64::from(entry.health_score))
            .bind(entry.last_activity_at)
            .bind(entry.harvested_at)
            .bind(&metadata)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid(),
        };

        insert_children(&mut tx, id, entry).await?;
        tx.commit().await?;

        debug!(
            locator = %entry.locator,
            id,
            replaced = existing.is_some(),
            capabilities = entry.capabilities.len(),
            dependencies = entry.dependencies.len(),
            "Catalog entry stored"
        );
        Ok(id)
    }

    pub async fn find_by_locator(&self, locator: &str) -> Result<Option<CatalogEntry>, HarvestError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM catalog_entries WHERE locator = ?",
            ENTRY_COLUMNS
        ))
        .bind(locator)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(&row).await?)),
            None => Ok(None),
        }
    }

    /// Locators in ascending order, optionally restricted to one source.
    pub async fn list_locators(&self, source: Option<SourceType>) -> Result<Vec<String>, HarvestError> {
        let locators = match source {
            Some(source) => {
                sqlx::query_scalar(
                    "SELECT locator FROM catalog_entries WHERE source_type = ? ORDER BY locator",
                )
                .bind(source.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT locator FROM catalog_entries ORDER BY locator")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(locators)
    }

    pub async fn count(&self) -> Result<i64, HarvestError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM catalog_entries")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Sets the stored risk level without touching anything else.
    pub async fn update_risk(&self, locator: &str, risk: RiskLevel) -> Result<bool, HarvestError> {
        let lock = self.lock_for(locator);
        let updated = {
            let _guard = lock.lock().await;
            sqlx::query("UPDATE catalog_entries SET risk_level = ?, updated_at = ? WHERE locator = ?")
                .bind(risk.as_str())
                .bind(Utc::now())
                .bind(locator)
                .execute(&self.pool)
                .await?
                .rows_affected()
                > 0
        };
        drop(lock);
        self.release_lock(locator);
        Ok(updated)
    }

    /// Deletes an entry and its children. Checkpoints pointing at it go
    /// back to pending so the identifier can be harvested again.
    pub async fn delete(&self, locator: &str) -> Result<bool, HarvestError> {
        let lock = self.lock_for(locator);
        let deleted = {
            let _guard = lock.lock().await;
            let mut tx = self.pool.begin().await?;
            let deleted = delete_locator(&mut tx, locator).await?;
            tx.commit().await?;
            deleted
        };
        drop(lock);
        self.release_lock(locator);
        Ok(deleted)
    }

    /// Deletes every entry harvested before `cutoff`. Returns how many went.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, HarvestError> {
        let stale: Vec<String> = sqlx::query_scalar(
            "SELECT locator FROM catalog_entries WHERE harvested_at < ? ORDER BY locator",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut pruned = 0;
        for locator in &stale {
            if self.delete(locator).await? {
                pruned += 1;
            }
        }

        info!(pruned, cutoff = %cutoff, "Pruned stale catalog entries");
        Ok(pruned)
    }

    async fn hydrate(&self, row: &SqliteRow) -> Result<CatalogEntry, HarvestError> {
        let id: i64 = row.try_get("id")?;
        let mut entry = entry_from_row(row)?;

        let mut conn = self.pool.acquire().await?;

        for row in sqlx::query(
            "SELECT kind, name, description, input_schema FROM entry_capabilities \
             WHERE entry_id = ? ORDER BY position",
        )
        .bind(id)
        .fetch_all(&mut *conn)
        .await?
        {
            let kind: String = row.try_get("kind")?;
            entry.capabilities.push(Capability {
                kind: parse_column::<CapabilityKind>("kind", &kind)?,
                name: row.try_get("name")?,
                description: row.try_get("description")?,
                input_schema: row.try_get("input_schema")?,
            });
        }

        for row in sqlx::query(
            "SELECT library_name, version_constraint, ecosystem, kind FROM entry_dependencies \
             WHERE entry_id = ? ORDER BY position",
        )
        .bind(id)
        .fetch_all(&mut *conn)
        .await?
        {
            let kind: String = row.try_get("kind")?;
            entry.dependencies.push(Dependency {
                library_name: row.try_get("library_name")?,
                version_constraint: row.try_get("version_constraint")?,
                ecosystem: row.try_get("ecosystem")?,
                kind: parse_column::<DependencyKind>("kind", &kind)?,
            });
        }

        for row in sqlx::query(
            "SELECT version, name, published_at, url, prerelease FROM entry_releases \
             WHERE entry_id = ? ORDER BY position",
        )
        .bind(id)
        .fetch_all(&mut *conn)
        .await?
        {
            entry.releases.push(Release {
                version: row.try_get("version")?,
                name: row.try_get("name")?,
                published_at: row.try_get("published_at")?,
                url: row.try_get("url")?,
                prerelease: row.try_get("prerelease")?,
            });
        }

        for row in sqlx::query(
            "SELECT login, contributions FROM entry_contributors \
             WHERE entry_id = ? ORDER BY position",
        )
        .bind(id)
        .fetch_all(&mut *conn)
        .await?
        {
            entry.contributors.push(Contributor {
                login: row.try_get("login")?,
                contributions: row.try_get("contributions")?,
            });
        }

        Ok(entry)
    }

    /// Every stored entry with its children, in locator order.
    pub async fn list_entries(&self, source: Option<SourceType>) -> Result<Vec<CatalogEntry>, HarvestError> {
        let mut entries = Vec::new();
        for locator in self.list_locators(source).await? {
            if let Some(entry) = self.find_by_locator(&locator).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<CatalogEntry, HarvestError> {
    let source_type: String = row.try_get("source_type")?;
    let risk_level: String = row.try_get("risk_level")?;
    let metadata: String = row.try_get("metadata")?;
    let health_score: i64 = row.try_get("health_score")?;

    let metadata = match serde_json::from_str::<serde_json::Value>(&metadata) {
        Ok(serde_json::Value::Object(map)) => map,
        Ok(_) => serde_json::Map::new(),
        Err(e) => return Err(decode_error("metadata", e.to_string())),
    };

    Ok(CatalogEntry {
        locator: row.try_get("locator")?,
        source_type: parse_column::<SourceType>("source_type", &source_type)?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        version: row.try_get("version")?,
        author: row.try_get("author")?,
        license: row.try_get("license")?,
        homepage: row.try_get("homepage")?,
        repository_url: row.try_get("repository_url")?,
        stars: row.try_get("stars")?,
        forks: row.try_get("forks")?,
        downloads: row.try_get("downloads")?,
        open_issues: row.try_get("open_issues")?,
        risk_level: parse_column::<RiskLevel>("risk_level", &risk_level)?,
        verified: row.try_get("verified")?,
        health_score: health_score.clamp(0, 100) as u8,
        last_activity_at: row.try_get("last_activity_at")?,
        harvested_at: row.try_get("harvested_at")?,
        metadata,
        capabilities: Vec::new(),
        dependencies: Vec::new(),
        releases: Vec::new(),
        contributors: Vec::new(),
    })
}

async fn insert_children(
    tx: &mut Transaction<'_, Sqlite>,
    id: i64,
    entry: &CatalogEntry,
) -> Result<(), HarvestError> {
    for (position, capability) in entry.capabilities.iter().enumerate() {
        sqlx::query(
            "INSERT INTO entry_capabilities (entry_id, position, kind, name, description, input_schema) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(position as i64)
        .bind(capability.kind.as_str())
        .bind(&capability.name)
        .bind(&capability.description)
        .bind(&capability.input_schema)
        .execute(&mut **tx)
        .await?;
    }

    for (position, dependency) in entry.dependencies.iter().enumerate() {
        sqlx::query(
            "INSERT INTO entry_dependencies (entry_id, position, library_name, version_constraint, ecosystem, kind) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(position as i64)
        .bind(&dependency.library_name)
        .bind(&dependency.version_constraint)
        .bind(&dependency.ecosystem)
        .bind(dependency.kind.as_str())
        .execute(&mut **tx)
        .await?;
    }

    for (position, release) in entry.releases.iter().enumerate() {
        sqlx::query(
            "INSERT INTO entry_releases (entry_id, position, version, name, published_at, url, prerelease) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(position as i64)
        .bind(&release.version)
        .bind(&release.name)
        .bind(release.published_at)
        .bind(&release.url)
        .bind(release.prerelease)
        .execute(&mut **tx)
        .await?;
    }

    for (position, contributor) in entry.contributors.iter().enumerate() {
        sqlx::query(
            "INSERT INTO entry_contributors (entry_id, position, login, contributions) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(position as i64)
        .bind(&contributor.login)
        .bind(contributor.contributions)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

async fn delete_locator(tx: &mut Transaction<'_, Sqlite>, locator: &str) -> Result<bool, HarvestError> {
    let id: Option<i64> = sqlx::query_scalar("SELECT id FROM catalog_entries WHERE locator = ?")
        .bind(locator)
        .fetch_optional(&mut **tx)
        .await?;
    let Some(id) = id else {
        return Ok(false);
    };

    for table in CHILD_TABLES {
        sqlx::query(&format!("DELETE FROM {} WHERE entry_id = ?", table))
            .bind(id)
            .execute(&mut **tx)
            .await?;
    }
    sqlx::query("DELETE FROM catalog_entries WHERE id = ?")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    sqlx::query(
        "UPDATE harvest_checkpoints SET status = 'pending', locator = NULL, updated_at = ? \
         WHERE locator = ?",
    )
    .bind(Utc::now())
    .bind(locator)
    .execute(&mut **tx)
    .await?;
    Ok(true)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::harvest::schema::tests::test_pool;
    use chrono::Duration;

    pub(crate) fn sample_entry(locator: &str, tools: usize) -> CatalogEntry {
        let mut entry = CatalogEntry::new(locator, SourceType::Npm, "demo-server");
        entry.description = Some("Demo MCP server".to_string());
        entry.version = Some("1.2.0".to_string());
        entry.license = Some("MIT".to_string());
        entry.downloads = 4200;
        entry.risk_level = RiskLevel::Moderate;
        entry.health_score = 61;
        entry
            .metadata
            .insert("code_risk".to_string(), serde_json::json!({"level": "moderate"}));
        entry.capabilities = (0..tools)
            .map(|i| Capability::new(CapabilityKind::Tool, format!("tool_{}", i)))
            .collect();
        entry.dependencies = vec![Dependency {
            library_name: "@modelcontextprotocol/sdk".to_string(),
            version_constraint: Some("^1.0.0".to_string()),
            ecosystem: "npm".to_string(),
            kind: DependencyKind::Runtime,
        }];
        entry.releases = vec![Release {
            version: "1.2.0".to_string(),
            name: None,
            published_at: Some(Utc::now() - Duration::days(3)),
            url: None,
            prerelease: false,
        }];
        entry.contributors = vec![Contributor {
            login: "octocat".to_string(),
            contributions: 12,
        }];
        entry
    }

    async fn child_count(store: &CatalogStore, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(store.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_roundtrip() {
        let store = CatalogStore::new(test_pool().await);
        let entry = sample_entry("npm:demo-server", 3);
        store.upsert(&entry).await.unwrap();

        let loaded = store.find_by_locator("npm:demo-server").await.unwrap().unwrap();
        assert_eq!(loaded.name, entry.name);
        assert_eq!(loaded.risk_level, RiskLevel::Moderate);
        assert_eq!(loaded.health_score, 61);
        assert_eq!(loaded.capabilities, entry.capabilities);
        assert_eq!(loaded.dependencies, entry.dependencies);
        assert_eq!(loaded.contributors, entry.contributors);
        assert_eq!(loaded.metadata, entry.metadata);
        assert!(store.find_by_locator("npm:missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let store = CatalogStore::new(test_pool().await);
        let entry = sample_entry("npm:demo-server", 3);
        let first_id = store.upsert(&entry).await.unwrap();
        let first = store.find_by_locator(&entry.locator).await.unwrap().unwrap();

        let second_id = store.upsert(&entry).await.unwrap();
        let second = store.find_by_locator(&entry.locator).await.unwrap().unwrap();

        assert_eq!(first_id, second_id);
        assert_eq!(first, second);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(child_count(&store, "entry_capabilities").await, 3);
    }

    #[tokio::test]
    async fn test_shrinking_capabilities_leave_no_residue() {
        let store = CatalogStore::new(test_pool().await);
        store.upsert(&sample_entry("npm:demo-server", 5)).await.unwrap();
        store.upsert(&sample_entry("npm:demo-server", 3)).await.unwrap();

        let loaded = store.find_by_locator("npm:demo-server").await.unwrap().unwrap();
        assert_eq!(loaded.capabilities.len(), 3);
        assert_eq!(child_count(&store, "entry_capabilities").await, 3);
        assert_eq!(child_count(&store, "entry_dependencies").await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_upserts_of_same_locator() {
        let store = CatalogStore::new(test_pool().await);
        let mut handles = Vec::new();
        for tools in 1..=6 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.upsert(&sample_entry("npm:demo-server", tools)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let loaded = store.find_by_locator("npm:demo-server").await.unwrap().unwrap();
        assert_eq!(
            child_count(&store, "entry_capabilities").await,
            loaded.capabilities.len() as i64
        );
        assert_eq!(store.count().await.unwrap(), 1);
        assert!(store.locks.is_empty());
    }

    #[tokio::test]
    async fn test_update_risk_and_delete() {
        let store = CatalogStore::new(test_pool().await);
        store.upsert(&sample_entry("npm:a", 1)).await.unwrap();

        assert!(store.update_risk("npm:a", RiskLevel::Critical).await.unwrap());
        assert!(!store.update_risk("npm:missing", RiskLevel::Critical).await.unwrap());
        let loaded = store.find_by_locator("npm:a").await.unwrap().unwrap();
        assert_eq!(loaded.risk_level, RiskLevel::Critical);

        assert!(store.delete("npm:a").await.unwrap());
        assert!(!store.delete("npm:a").await.unwrap());
        assert_eq!(child_count(&store, "entry_capabilities").await, 0);
    }

    #[tokio::test]
    async fn test_prune_older_than() {
        let store = CatalogStore::new(test_pool().await);
        let mut old = sample_entry("npm:old", 1);
        old.harvested_at = Utc::now() - Duration::days(90);
        store.upsert(&old).await.unwrap();
        store.upsert(&sample_entry("npm:fresh", 1)).await.unwrap();

        let pruned = store
            .prune_older_than(Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.list_locators(None).await.unwrap(), vec!["npm:fresh"]);
        assert_eq!(
            store.list_locators(Some(SourceType::Pypi)).await.unwrap().len(),
            0
        );
    }
}
