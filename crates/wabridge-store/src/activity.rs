//! Append-only activity log, shared by the master catalog and every
//! per-account store. Reads are always scoped to one operator.

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, warn};
use wabridge_core::{BridgeError, OperatorId};

use crate::db_err;

/// An entry to append.
#[derive(Debug, Clone)]
pub struct ActivityEntry {
    pub action: String,
    pub description: String,
    pub operator_id: OperatorId,
    pub success: bool,
    pub error: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl ActivityEntry {
    pub fn ok(operator_id: OperatorId, action: &str, description: impl Into<String>) -> Self {
        Self {
            action: action.to_string(),
            description: description.into(),
            operator_id,
            success: true,
            error: None,
            metadata: None,
        }
    }

    pub fn failed(
        operator_id: OperatorId,
        action: &str,
        description: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::ok(operator_id, action, description)
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A stored entry.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityLog {
    pub id: i64,
    pub action: String,
    pub description: String,
    pub operator_id: OperatorId,
    pub success: bool,
    pub error: Option<String>,
    pub metadata_json: Option<String>,
    pub created_at: String,
}

type ActivityRow = (
    i64,
    String,
    String,
    i64,
    i64,
    Option<String>,
    Option<String>,
    String,
);

pub(crate) async fn append(pool: &SqlitePool, entry: &ActivityEntry) -> Result<i64, BridgeError> {
    let metadata_json = entry
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    let result = sqlx::query(
        "INSERT INTO activity_logs \
         (action, description, operator_id, success, error, metadata_json) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.action)
    .bind(&entry.description)
    .bind(entry.operator_id)
    .bind(entry.success as i64)
    .bind(&entry.error)
    .bind(&metadata_json)
    .execute(pool)
    .await
    .map_err(db_err("activity log write failed"))?;

    debug!(
        "activity: {} [{}] {}",
        entry.operator_id,
        if entry.success { "ok" } else { "error" },
        entry.action
    );
    Ok(result.last_insert_rowid())
}

pub(crate) async fn recent(
    pool: &SqlitePool,
    operator_id: OperatorId,
    limit: i64,
) -> Result<Vec<ActivityLog>, BridgeError> {
    let rows: Vec<ActivityRow> = sqlx::query_as(
        "SELECT id, action, description, operator_id, success, error, metadata_json, created_at \
         FROM activity_logs WHERE operator_id = ? ORDER BY id DESC LIMIT ?",
    )
    .bind(operator_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(db_err("activity log read failed"))?;

    let logs = rows
        .into_iter()
        .map(
            |(id, action, description, op, success, error, metadata_json, created_at)| {
                ActivityLog {
                    id,
                    action,
                    description,
                    operator_id: op,
                    success: success != 0,
                    error,
                    metadata_json,
                    created_at,
                }
            },
        )
        .filter(|log| {
            // Second line of defence behind the WHERE clause.
            if log.operator_id != operator_id {
                warn!(
                    "dropping activity row {} of operator {} from query for {operator_id}",
                    log.id, log.operator_id
                );
                return false;
            }
            true
        })
        .collect();
    Ok(logs)
}
