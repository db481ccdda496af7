//! Per-account auxiliary store: group cache, message log, activity log.

use serde::Serialize;
use sqlx::SqlitePool;
use std::path::Path;
use tracing::warn;
use wabridge_core::{message::GroupInfo, BridgeError, OperatorId};

use crate::activity::{self, ActivityEntry, ActivityLog};
use crate::{db_err, open_existing_pool, open_pool, run_migrations, stats, BOT_MIGRATIONS};

/// A cached group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedGroup {
    pub group_jid: String,
    pub group_name: String,
    pub updated_at: String,
}

/// Handle over one account's bot-data database.
#[derive(Clone)]
pub struct BotStore {
    pool: SqlitePool,
}

impl BotStore {
    /// Open the store at `path`, creating file and schema when missing.
    pub async fn open(path: &Path) -> Result<Self, BridgeError> {
        let pool = open_pool(path, 4).await?;
        Self::from_pool(pool).await
    }

    /// Open the store at `path` only if the file is already there. Used by
    /// background writers that must not resurrect a removed account.
    pub async fn open_existing(path: &Path) -> Result<Self, BridgeError> {
        let pool = open_existing_pool(path, 4).await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, BridgeError> {
        run_migrations(&pool, BOT_MIGRATIONS).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn upsert_group(&self, jid: &str, name: &str) -> Result<(), BridgeError> {
        sqlx::query(
            "INSERT INTO groups (group_jid, group_name) VALUES (?, ?) \
             ON CONFLICT(group_jid) DO UPDATE SET \
             group_name = excluded.group_name, updated_at = datetime('now')",
        )
        .bind(jid)
        .bind(name)
        .execute(&self.pool)
        .await
        .map_err(db_err("group upsert failed"))?;
        Ok(())
    }

    /// Upsert many groups in one transaction; nothing is written on error.
    pub async fn upsert_groups(&self, groups: &[GroupInfo]) -> Result<usize, BridgeError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_err("transaction begin failed"))?;

        for group in groups {
            let result = sqlx::query(
                "INSERT INTO groups (group_jid, group_name) VALUES (?, ?) \
                 ON CONFLICT(group_jid) DO UPDATE SET \
                 group_name = excluded.group_name, updated_at = datetime('now')",
            )
            .bind(&group.jid)
            .bind(&group.name)
            .execute(&mut *tx)
            .await;

            if let Err(e) = result {
                if let Err(rb) = tx.rollback().await {
                    warn!("group batch rollback failed: {rb}");
                }
                return Err(BridgeError::Db(format!("group batch upsert failed: {e}")));
            }
        }

        tx.commit()
            .await
            .map_err(db_err("transaction commit failed"))?;
        stats::set(&self.pool, stats::GROUPS_CACHED, self.group_count().await?).await?;
        Ok(groups.len())
    }

    /// Cached groups whose name or JID contains `query` (case-insensitive),
    /// ordered by name.
    pub async fn list_groups(&self, query: Option<&str>) -> Result<Vec<CachedGroup>, BridgeError> {
        let pattern = format!("%{}%", query.unwrap_or("").trim());
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            "SELECT group_jid, group_name, updated_at FROM groups \
             WHERE group_name LIKE ? OR group_jid LIKE ? \
             ORDER BY group_name COLLATE NOCASE, group_jid",
        )
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("group list failed"))?;

        Ok(rows
            .into_iter()
            .map(|(group_jid, group_name, updated_at)| CachedGroup {
                group_jid,
                group_name,
                updated_at,
            })
            .collect())
    }

    pub async fn group_count(&self) -> Result<i64, BridgeError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM groups")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("group count failed"))?;
        Ok(n)
    }

    pub async fn remove_group(&self, jid: &str) -> Result<(), BridgeError> {
        sqlx::query("DELETE FROM groups WHERE group_jid = ?")
            .bind(jid)
            .execute(&self.pool)
            .await
            .map_err(db_err("group delete failed"))?;
        Ok(())
    }

    /// Append to the lightweight message log.
    pub async fn log_message(&self, sender: &str, text: &str) -> Result<(), BridgeError> {
        let timestamp = chrono::Utc::now().to_rfc3339();
        sqlx::query("INSERT INTO messages (sender, message, timestamp) VALUES (?, ?, ?)")
            .bind(sender)
            .bind(text)
            .bind(&timestamp)
            .execute(&self.pool)
            .await
            .map_err(db_err("message log failed"))?;
        stats::increment(&self.pool, stats::MESSAGES_SEEN, 1).await
    }

    pub async fn message_count(&self) -> Result<i64, BridgeError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("message count failed"))?;
        Ok(n)
    }

    pub async fn log_activity(&self, entry: &ActivityEntry) -> Result<i64, BridgeError> {
        activity::append(&self.pool, entry).await
    }

    pub async fn recent_activity(
        &self,
        operator_id: OperatorId,
        limit: i64,
    ) -> Result<Vec<ActivityLog>, BridgeError> {
        activity::recent(&self.pool, operator_id, limit).await
    }

    pub async fn increment_stat(&self, key: &str, by: i64) -> Result<(), BridgeError> {
        stats::increment(&self.pool, key, by).await
    }

    pub async fn statistics(&self) -> Result<Vec<(String, i64)>, BridgeError> {
        stats::all(&self.pool).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
