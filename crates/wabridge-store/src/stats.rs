//! Named counters in the `statistics` table.

use sqlx::SqlitePool;
use wabridge_core::BridgeError;

use crate::db_err;

pub const MESSAGES_SEEN: &str = "messages_seen";
pub const BULK_UPDATED: &str = "bulk_updated";
pub const BULK_FAILED: &str = "bulk_failed";
pub const GROUPS_CACHED: &str = "groups_cached";

pub(crate) async fn increment(pool: &SqlitePool, key: &str, by: i64) -> Result<(), BridgeError> {
    sqlx::query(
        "INSERT INTO statistics (stat_key, stat_value) VALUES (?, ?) \
         ON CONFLICT(stat_key) DO UPDATE SET \
         stat_value = stat_value + excluded.stat_value, updated_at = datetime('now')",
    )
    .bind(key)
    .bind(by)
    .execute(pool)
    .await
    .map_err(db_err("statistics update failed"))?;
    Ok(())
}

pub(crate) async fn set(pool: &SqlitePool, key: &str, value: i64) -> Result<(), BridgeError> {
    sqlx::query(
        "INSERT INTO statistics (stat_key, stat_value) VALUES (?, ?) \
         ON CONFLICT(stat_key) DO UPDATE SET \
         stat_value = excluded.stat_value, updated_at = datetime('now')",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .map_err(db_err("statistics update failed"))?;
    Ok(())
}

pub(crate) async fn get(pool: &SqlitePool, key: &str) -> Result<i64, BridgeError> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT stat_value FROM statistics WHERE stat_key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .map_err(db_err("statistics read failed"))?;
    Ok(row.map(|(v,)| v).unwrap_or(0))
}

pub(crate) async fn all(pool: &SqlitePool) -> Result<Vec<(String, i64)>, BridgeError> {
    sqlx::query_as("SELECT stat_key, stat_value FROM statistics ORDER BY stat_key")
        .fetch_all(pool)
        .await
        .map_err(db_err("statistics read failed"))
}
