//! # wabridge-store
//!
//! SQLite persistence for wabridge:
//! - `catalog`: the master catalog of paired accounts (process-wide)
//! - `bot_data`: per-account group cache, message log, activity log
//! - `pools`: the current-account pool registry
//! - `device`: upstream device-store schema and validation
//! - `backup`: point-in-time copies of device stores

pub mod activity;
pub mod backup;
pub mod bot_data;
pub mod catalog;
pub mod device;
pub mod pools;
pub mod stats;

#[cfg(test)]
mod tests;

pub use activity::{ActivityEntry, ActivityLog};
pub use bot_data::BotStore;
pub use catalog::{Account, AccountStatus, Catalog};
pub use device::{validate_device_store, DeviceValidation};
pub use pools::PoolRegistry;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use wabridge_core::BridgeError;

/// How long a connection waits on a locked database before failing.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) const MASTER_MIGRATIONS: &[(&str, &str)] = &[(
    "001_init",
    include_str!("../migrations/master/001_init.sql"),
)];

pub(crate) const BOT_MIGRATIONS: &[(&str, &str)] =
    &[("001_init", include_str!("../migrations/bot/001_init.sql"))];

pub(crate) const DEVICE_MIGRATIONS: &[(&str, &str)] = &[
    ("001_init", include_str!("../migrations/device/001_init.sql")),
    (
        "002_pending_device",
        include_str!("../migrations/device/002_pending_device.sql"),
    ),
];

pub(crate) fn db_err(context: &str) -> impl Fn(sqlx::Error) -> BridgeError + '_ {
    move |e| BridgeError::Db(format!("{context}: {e}"))
}

/// Open a pool with write-ahead journaling, shared cache, and a busy timeout
/// long enough to absorb concurrent access. The parent folder is created
/// first, and the pool is pinged before it is returned.
pub async fn open_pool(path: &Path, max_connections: u32) -> Result<SqlitePool, BridgeError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            wabridge_core::paths::ensure_dir(parent)?;
        }
    }
    connect(path, max_connections, true).await
}

/// [`open_pool`] over a file that must already exist. Fails instead of
/// creating it.
pub async fn open_existing_pool(
    path: &Path,
    max_connections: u32,
) -> Result<SqlitePool, BridgeError> {
    if !path.is_file() {
        return Err(BridgeError::Db(format!("{} does not exist", path.display())));
    }
    connect(path, max_connections, false).await
}

async fn connect(
    path: &Path,
    max_connections: u32,
    create: bool,
) -> Result<SqlitePool, BridgeError> {
    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Wal)
        .shared_cache(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(opts)
        .await
        .map_err(|e| BridgeError::Db(format!("failed to open {}: {e}", path.display())))?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(db_err("ping failed"))?;

    Ok(pool)
}

/// Apply named migrations once each, tracked in `_migrations`.
pub(crate) async fn run_migrations(
    pool: &SqlitePool,
    migrations: &[(&str, &str)],
) -> Result<(), BridgeError> {
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS _migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .execute(pool)
    .await
    .map_err(db_err("failed to create migrations table"))?;

    for (name, sql) in migrations {
        let applied: Option<(String,)> =
            sqlx::query_as("SELECT name FROM _migrations WHERE name = ?")
                .bind(name)
                .fetch_optional(pool)
                .await
                .map_err(db_err("failed to check migration"))?;

        if applied.is_some() {
            continue;
        }

        sqlx::raw_sql(sql)
            .execute(pool)
            .await
            .map_err(|e| BridgeError::Db(format!("migration {name} failed: {e}")))?;

        sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
            .bind(name)
            .execute(pool)
            .await
            .map_err(|e| BridgeError::Db(format!("failed to record migration {name}: {e}")))?;
    }
    Ok(())
}

/// Database file size in bytes.
pub async fn db_size(pool: &SqlitePool) -> Result<u64, BridgeError> {
    let (page_count,): (i64,) = sqlx::query_as("PRAGMA page_count")
        .fetch_one(pool)
        .await
        .map_err(db_err("pragma failed"))?;
    let (page_size,): (i64,) = sqlx::query_as("PRAGMA page_size")
        .fetch_one(pool)
        .await
        .map_err(db_err("pragma failed"))?;
    Ok((page_count * page_size) as u64)
}
