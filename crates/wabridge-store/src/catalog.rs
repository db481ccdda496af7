//! Master catalog: the single process-wide list of paired accounts.

use serde::Serialize;
use sqlx::SqlitePool;
use std::path::Path;
use tracing::info;
use wabridge_core::{paths::path_string, AccountId, BridgeError, OperatorId};

use crate::activity::{self, ActivityEntry, ActivityLog};
use crate::{db_err, open_pool, run_migrations, stats, MASTER_MIGRATIONS};

/// Persisted connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccountStatus {
    Active,
    Inactive,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    fn parse(s: &str) -> Self {
        if s == "active" {
            Self::Active
        } else {
            Self::Inactive
        }
    }
}

/// One catalog row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub id: AccountId,
    pub phone: String,
    pub upstream_db_path: String,
    pub bot_db_path: String,
    pub status: AccountStatus,
    pub created_at: String,
    pub updated_at: String,
}

impl Account {
    /// Operator that owns this account, decoded from the canonical path.
    pub fn operator_id(&self) -> Option<OperatorId> {
        wabridge_core::paths::parse_db_path(Path::new(&self.upstream_db_path))
            .map(|p| p.operator_id)
    }
}

type AccountRow = (i64, String, String, String, String, String, String);

const SELECT_ACCOUNT: &str = "SELECT id, phone, upstream_db_path, bot_db_path, status, \
                              created_at, updated_at FROM whatsapp_accounts";

fn to_account(row: AccountRow) -> Account {
    let (id, phone, upstream_db_path, bot_db_path, status, created_at, updated_at) = row;
    Account {
        id,
        phone,
        upstream_db_path,
        bot_db_path,
        status: AccountStatus::parse(&status),
        created_at,
        updated_at,
    }
}

/// Master catalog backed by SQLite.
#[derive(Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    /// Open (creating if missing) the master database and its schema.
    pub async fn open(path: &Path) -> Result<Self, BridgeError> {
        let pool = open_pool(path, 4).await?;
        let catalog = Self::from_pool(pool).await?;
        info!("Master catalog initialized at {}", path.display());
        Ok(catalog)
    }

    /// Wrap an existing pool, creating the schema lazily.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, BridgeError> {
        run_migrations(&pool, MASTER_MIGRATIONS).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Register an account. Re-registering a known phone replaces its paths
    /// in place and keeps its id.
    pub async fn add(
        &self,
        phone: &str,
        upstream_db_path: &Path,
        bot_db_path: &Path,
    ) -> Result<AccountId, BridgeError> {
        sqlx::query(
            "INSERT INTO whatsapp_accounts (phone, upstream_db_path, bot_db_path, status) \
             VALUES (?, ?, ?, 'active') \
             ON CONFLICT(phone) DO UPDATE SET \
             upstream_db_path = excluded.upstream_db_path, \
             bot_db_path = excluded.bot_db_path, \
             updated_at = datetime('now')",
        )
        .bind(phone)
        .bind(path_string(upstream_db_path))
        .bind(path_string(bot_db_path))
        .execute(&self.pool)
        .await
        .map_err(db_err("account insert failed"))?;

        let (id,): (i64,) = sqlx::query_as("SELECT id FROM whatsapp_accounts WHERE phone = ?")
            .bind(phone)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("account lookup failed"))?;
        Ok(id)
    }

    /// Every account, ascending by id.
    pub async fn list(&self) -> Result<Vec<Account>, BridgeError> {
        let rows: Vec<AccountRow> = sqlx::query_as(&format!("{SELECT_ACCOUNT} ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("account list failed"))?;
        Ok(rows.into_iter().map(to_account).collect())
    }

    pub async fn get(&self, id: AccountId) -> Result<Option<Account>, BridgeError> {
        let row: Option<AccountRow> = sqlx::query_as(&format!("{SELECT_ACCOUNT} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("account get failed"))?;
        Ok(row.map(to_account))
    }

    pub async fn get_by_phone(&self, phone: &str) -> Result<Option<Account>, BridgeError> {
        let row: Option<AccountRow> =
            sqlx::query_as(&format!("{SELECT_ACCOUNT} WHERE phone = ?"))
                .bind(phone)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err("account get failed"))?;
        Ok(row.map(to_account))
    }

    /// Accounts whose upstream path equals `path`.
    pub async fn find_by_upstream_path(&self, path: &Path) -> Result<Option<Account>, BridgeError> {
        let row: Option<AccountRow> =
            sqlx::query_as(&format!("{SELECT_ACCOUNT} WHERE upstream_db_path = ?"))
                .bind(path_string(path))
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err("account get failed"))?;
        Ok(row.map(to_account))
    }

    pub async fn count(&self) -> Result<usize, BridgeError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM whatsapp_accounts")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("account count failed"))?;
        Ok(n as usize)
    }

    /// Returns whether a row was updated.
    pub async fn update_status(
        &self,
        id: AccountId,
        status: AccountStatus,
    ) -> Result<bool, BridgeError> {
        let result = sqlx::query(
            "UPDATE whatsapp_accounts SET status = ?, updated_at = datetime('now') \
             WHERE id = ? AND status != ?",
        )
        .bind(status.as_str())
        .bind(id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err("status update failed"))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_paths(
        &self,
        id: AccountId,
        upstream_db_path: &Path,
        bot_db_path: &Path,
    ) -> Result<(), BridgeError> {
        sqlx::query(
            "UPDATE whatsapp_accounts SET upstream_db_path = ?, bot_db_path = ?, \
             updated_at = datetime('now') WHERE id = ?",
        )
        .bind(path_string(upstream_db_path))
        .bind(path_string(bot_db_path))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(db_err("path update failed"))?;
        Ok(())
    }

    /// Returns whether a row was deleted.
    pub async fn remove(&self, id: AccountId) -> Result<bool, BridgeError> {
        let result = sqlx::query("DELETE FROM whatsapp_accounts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("account delete failed"))?;
        Ok(result.rows_affected() > 0)
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

    pub async fn stat(&self, key: &str) -> Result<i64, BridgeError> {
        stats::get(&self.pool, key).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
