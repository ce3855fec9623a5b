//! SQLite pool setup and table creation.
//!
//! Tables are created with `CREATE TABLE IF NOT EXISTS` when the context
//! opens; there is no versioned migration system. Child tables carry an
//! `entry_id` and a `position` so collections read back in insertion order.
//! No foreign-key cascade is relied on: the store deletes children
//! explicitly.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS catalog_entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        locator TEXT NOT NULL UNIQUE,
        source_type TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT,
        version TEXT,
        author TEXT,
        license TEXT,
        homepage TEXT,
        repository_url TEXT,
        stars INTEGER NOT NULL DEFAULT 0,
        forks INTEGER NOT NULL DEFAULT 0,
        downloads INTEGER NOT NULL DEFAULT 0,
        open_issues INTEGER NOT NULL DEFAULT 0,
        risk_level TEXT NOT NULL,
        verified INTEGER NOT NULL DEFAULT 0,
        health_score INTEGER NOT NULL DEFAULT 0,
        last_activity_at TEXT,
        harvested_at TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS entry_capabilities (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entry_id INTEGER NOT NULL REFERENCES catalog_entries(id),
        position INTEGER NOT NULL,
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT,
        input_schema TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS entry_dependencies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entry_id INTEGER NOT NULL REFERENCES catalog_entries(id),
        position INTEGER NOT NULL,
        library_name TEXT NOT NULL,
        version_constraint TEXT,
        ecosystem TEXT NOT NULL,
        kind TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS entry_releases (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entry_id INTEGER NOT NULL REFERENCES catalog_entries(id),
        position INTEGER NOT NULL,
        version TEXT NOT NULL,
        name TEXT,
        published_at TEXT,
        url TEXT,
        prerelease INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS entry_contributors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entry_id INTEGER NOT NULL REFERENCES catalog_entries(id),
        position INTEGER NOT NULL,
        login TEXT NOT NULL,
        contributions INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS harvest_checkpoints (
        source_type TEXT NOT NULL,
        identifier TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_attempt_at TEXT,
        error_message TEXT,
        locator TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (source_type, identifier)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_capabilities_entry ON entry_capabilities(entry_id)",
    "CREATE INDEX IF NOT EXISTS idx_dependencies_entry ON entry_dependencies(entry_id)",
    "CREATE INDEX IF NOT EXISTS idx_releases_entry ON entry_releases(entry_id)",
    "CREATE INDEX IF NOT EXISTS idx_contributors_entry ON entry_contributors(entry_id)",
    "CREATE INDEX IF NOT EXISTS idx_checkpoints_status ON harvest_checkpoints(status)",
    "CREATE INDEX IF NOT EXISTS idx_entries_harvested ON catalog_entries(harvested_at)",
];

/// Opens a pool for `database_url` (WAL, 5s busy timeout, foreign keys on).
pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(5000))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await?;

    info!(database_url, max_connections, "Connected to catalog database");
    Ok(pool)
}

/// Single-connection in-memory pool. Every query shares the same database.
pub async fn connect_in_memory() -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
}

/// Creates every table and index that does not exist yet.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
