//! Telegram Bot API front end.
//!
//! Long-polls `getUpdates` for messages and inline-button callbacks, and
//! talks back through `sendMessage` / `editMessageText` / `deleteMessage`.
//! Docs: <https://core.telegram.org/bots/api>

mod polling;
mod send;
pub(crate) mod types;


use std::sync::Arc;
use tokio::sync::Mutex;

pub use send::split_message;

/// Seconds `getUpdates` is allowed to hold the request open.
pub const POLL_TIMEOUT_SECS: u64 = 60;

/// Telegram's per-message text limit.
pub const MAX_MESSAGE_LEN: usize = 4096;

/// Telegram channel using the Bot API with long polling.
pub struct TelegramChannel {
    client: reqwest::Client,
    base_url: String,
    /// Tracks the last update_id to avoid reprocessing.
    last_update_id: Arc<Mutex<Option<i64>>>,
}

impl TelegramChannel {
    pub fn new(bot_token: &str) -> Self {
        Self::with_base_url(format!("https://api.telegram.org/bot{bot_token}"))
    }

    /// Point the channel at a different API root (local Bot API server).
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            last_update_id: Arc::new(Mutex::new(None)),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{method}", self.base_url)
    }
}
