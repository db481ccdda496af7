//! JSON configuration: Telegram token, access lists, and runtime settings.


use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::BridgeError;
use crate::message::OperatorId;

/// Primary config location.
pub const DEFAULT_CONFIG_PATH: &str = "config/config.json";
/// Legacy location tried when the primary one is missing.
pub const FALLBACK_CONFIG_PATH: &str = "akses.json";

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub telegram_token: String,
    #[serde(default)]
    pub admin_ids: Vec<OperatorId>,
    #[serde(default)]
    pub allowed_user_ids: Vec<OperatorId>,
    /// Legacy single-operator field, folded into the lists on load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_allowed_id: Option<OperatorId>,
    #[serde(default)]
    pub settings: Settings,
}

/// Runtime knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_max_accounts")]
    pub max_accounts: usize,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_accounts: default_max_accounts(),
            timeout_seconds: default_timeout_seconds(),
            retry_attempts: default_retry_attempts(),
            log_level: default_log_level(),
        }
    }
}

impl Settings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

fn default_max_accounts() -> usize {
    10
}
fn default_timeout_seconds() -> u64 {
    30
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Fold the legacy field into the lists:
    /// - empty `allowed_user_ids` + set `user_allowed_id` → adopt it;
    /// - empty `admin_ids` → copy `allowed_user_ids`.
    ///
    /// Returns whether anything changed.
    pub fn migrate(&mut self) -> bool {
        let mut changed = false;
        if self.allowed_user_ids.is_empty() {
            if let Some(id) = self.user_allowed_id.filter(|id| *id != 0) {
                self.allowed_user_ids.push(id);
                changed = true;
            }
        }
        if self.admin_ids.is_empty() && !self.allowed_user_ids.is_empty() {
            self.admin_ids = self.allowed_user_ids.clone();
            changed = true;
        }
        changed
    }

    /// Access is granted iff the id is an admin or an allowed user.
    pub fn is_allowed(&self, id: OperatorId) -> bool {
        self.admin_ids.contains(&id) || self.allowed_user_ids.contains(&id)
    }

    pub fn is_admin(&self, id: OperatorId) -> bool {
        self.admin_ids.contains(&id)
    }

    /// Every operator that may use the bot, admins first, deduplicated.
    pub fn operators(&self) -> Vec<OperatorId> {
        let mut ids = self.admin_ids.clone();
        for id in &self.allowed_user_ids {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        ids
    }

    /// Write the config back as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<(), BridgeError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    BridgeError::Fs(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| BridgeError::Fs(format!("cannot write {}: {e}", path.display())))
    }
}

/// Pick the config file: an explicit path, else the primary location, else
/// the legacy fallback.
pub fn resolve_path(explicit: Option<&str>) -> Result<PathBuf, BridgeError> {
    if let Some(path) = explicit {
        return Ok(PathBuf::from(path));
    }
    for candidate in [DEFAULT_CONFIG_PATH, FALLBACK_CONFIG_PATH] {
        if Path::new(candidate).exists() {
            return Ok(PathBuf::from(candidate));
        }
    }
    Err(BridgeError::Config(format!(
        "no config found at {DEFAULT_CONFIG_PATH} or {FALLBACK_CONFIG_PATH}"
    )))
}

/// Parse config text and apply migration rules.
pub fn parse(content: &str) -> Result<Config, BridgeError> {
    let mut config: Config = serde_json::from_str(content)
        .map_err(|e| BridgeError::Config(format!("failed to parse config: {e}")))?;
    config.migrate();
    Ok(config)
}

/// Load and validate the config file.
///
/// `TELEGRAM_BOT_TOKEN` fills an empty token. A migrated legacy file is
/// written back so the normalised lists persist.
pub fn load(path: &Path) -> Result<Config, BridgeError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| BridgeError::Config(format!("failed to read {}: {e}", path.display())))?;

    let mut raw: Config = serde_json::from_str(&content)
        .map_err(|e| BridgeError::Config(format!("failed to parse config: {e}")))?;
    if raw.migrate() {
        info!("config: migrated legacy access fields in {}", path.display());
        if let Err(e) = raw.save(path) {
            tracing::warn!("config: could not persist migrated config: {e}");
        }
    }

    if raw.telegram_token.trim().is_empty() {
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            raw.telegram_token = token;
        }
    }
    validate(&raw)?;
    Ok(raw)
}

/// Reject configs the bot cannot start with.
pub fn validate(config: &Config) -> Result<(), BridgeError> {
    let token = config.telegram_token.trim();
    if token.is_empty() {
        return Err(BridgeError::Config("telegram_token is empty".into()));
    }
    if config.operators().is_empty() {
        return Err(BridgeError::Config(
            "no operators configured: set admin_ids or allowed_user_ids".into(),
        ));
    }
    Ok(())
}
