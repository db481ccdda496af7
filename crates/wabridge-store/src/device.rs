//! Upstream device-store schema and validation.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::fmt;
use std::path::Path;
use wabridge_core::BridgeError;

use crate::{db_err, open_pool, run_migrations, BUSY_TIMEOUT, DEVICE_MIGRATIONS};

/// Tables that may hold the device identity, newest layout first.
pub const DEVICE_TABLES: [&str; 2] = ["wa_device_info", "whatsmeow_device"];

/// Outcome of [`validate_device_store`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceValidation {
    Valid,
    MissingFile,
    NoDeviceTable,
    EmptyDeviceTable,
    Unreadable(String),
}

impl DeviceValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

impl fmt::Display for DeviceValidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Valid => write!(f, "valid"),
            Self::MissingFile => write!(f, "device store file missing"),
            Self::NoDeviceTable => write!(f, "no device table"),
            Self::EmptyDeviceTable => write!(f, "device table empty"),
            Self::Unreadable(e) => write!(f, "unreadable: {e}"),
        }
    }
}

/// Open a pool over an existing device store without creating it.
pub async fn open_existing(path: &Path) -> Result<SqlitePool, BridgeError> {
    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(false)
        .busy_timeout(BUSY_TIMEOUT);
    SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(opts)
        .await
        .map_err(|e| BridgeError::Db(format!("failed to open {}: {e}", path.display())))
}

/// A store is valid when the file exists, a device table exists, and that
/// table holds at least one row. Never writes to the file.
pub async fn validate_device_store(path: &Path) -> DeviceValidation {
    if !path.is_file() {
        return DeviceValidation::MissingFile;
    }
    let pool = match open_existing(path).await {
        Ok(p) => p,
        Err(e) => return DeviceValidation::Unreadable(e.to_string()),
    };
    let result = check_device_rows(&pool).await;
    pool.close().await;
    result
}

async fn check_device_rows(pool: &SqlitePool) -> DeviceValidation {
    for table in DEVICE_TABLES {
        let exists: Result<Option<(String,)>, _> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
                .bind(table)
                .fetch_optional(pool)
                .await;
        match exists {
            Ok(Some(_)) => {}
            Ok(None) => continue,
            Err(e) => return DeviceValidation::Unreadable(e.to_string()),
        }

        let count: Result<(i64,), _> = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(pool)
            .await;
        return match count {
            Ok((n,)) if n > 0 => DeviceValidation::Valid,
            Ok(_) => DeviceValidation::EmptyDeviceTable,
            Err(e) => DeviceValidation::Unreadable(e.to_string()),
        };
    }
    DeviceValidation::NoDeviceTable
}

/// Create (if needed) the device store at `path` with the full `wa_*` schema.
pub async fn init_device_store(path: &Path) -> Result<SqlitePool, BridgeError> {
    let pool = open_pool(path, 4).await?;
    run_migrations(&pool, DEVICE_MIGRATIONS).await?;
    Ok(pool)
}

/// Write a placeholder identity row. Used by offline tooling and tests to
/// mark a store as paired.
pub async fn write_identity_row(pool: &SqlitePool, data: &[u8]) -> Result<(), BridgeError> {
    sqlx::query("INSERT OR REPLACE INTO wa_device_info (id, data) VALUES (1, ?)")
        .bind(data)
        .execute(pool)
        .await
        .map_err(db_err("device identity write failed"))?;
    Ok(())
}
