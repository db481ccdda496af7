//! Point-in-time copies of an account's device store.

use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tracing::info;
use wabridge_core::{paths::ensure_dir, AccountId, BridgeError};

use crate::{db_err, device};

/// `account_<phone>_<id>_<YYYYMMDD_HHMMSS>.db`.
pub fn backup_file_name(phone: &str, id: AccountId, at: DateTime<Local>) -> String {
    format!("account_{phone}_{id}_{}.db", at.format("%Y%m%d_%H%M%S"))
}

/// Copy the device store at `source` into `backup_dir` with `VACUUM INTO`,
/// which produces a consistent snapshot even while the store is open.
pub async fn backup_account(
    source: &Path,
    backup_dir: &Path,
    phone: &str,
    id: AccountId,
) -> Result<PathBuf, BridgeError> {
    ensure_dir(backup_dir)?;
    let target = backup_dir.join(backup_file_name(phone, id, Local::now()));
    if target.exists() {
        return Err(BridgeError::Fs(format!(
            "backup {} already exists",
            target.display()
        )));
    }

    let pool = device::open_existing(source).await?;
    let result = sqlx::query("VACUUM INTO ?")
        .bind(target.to_string_lossy().to_string())
        .execute(&pool)
        .await
        .map_err(db_err("backup failed"));
    pool.close().await;
    result?;

    info!("backup of account {id} written to {}", target.display());
    Ok(target)
}
