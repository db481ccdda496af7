//! Long-polling update loop.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use wabridge_core::message::{CallbackInfo, IncomingMessage};

use super::types::{TgResponse, TgUpdate};
use super::{TelegramChannel, POLL_TIMEOUT_SECS};

impl TelegramChannel {
    /// Spawn the poll loop. Updates arrive on the returned receiver until
    /// `shutdown` fires or the receiver is dropped.
    pub fn start(&self, shutdown: CancellationToken) -> mpsc::Receiver<IncomingMessage> {
        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();
        let url = self.url("getUpdates");
        let last_update_id = self.last_update_id.clone();

        info!("telegram long polling started");

        tokio::spawn(async move {
            let mut backoff_secs: u64 = 1;

            loop {
                let offset = last_update_id.lock().await.map(|id| id + 1);
                let mut query = vec![("timeout", POLL_TIMEOUT_SECS.to_string())];
                if let Some(off) = offset {
                    query.push(("offset", off.to_string()));
                }
                query.push((
                    "allowed_updates",
                    r#"["message","callback_query"]"#.to_string(),
                ));

                let request = client
                    .get(&url)
                    .query(&query)
                    .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 5))
                    .send();
                let resp = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    resp = request => resp,
                };

                let failure = match resp {
                    Ok(r) => match r.json::<TgResponse<Vec<TgUpdate>>>().await {
                        Ok(body) if body.ok => {
                            backoff_secs = 1;
                            let updates = body.result.unwrap_or_default();
                            if let Some(last) = updates.last() {
                                *last_update_id.lock().await = Some(last.update_id);
                            }
                            for update in updates {
                                let Some(incoming) = update_to_incoming(update) else {
                                    continue;
                                };
                                if tx.send(incoming).await.is_err() {
                                    info!("telegram receiver dropped, stopping poll");
                                    return;
                                }
                            }
                            None
                        }
                        Ok(body) => Some(format!(
                            "API error: {}",
                            body.description.unwrap_or_default()
                        )),
                        Err(e) => Some(format!("parse error: {e}")),
                    },
                    Err(e) => Some(format!("poll error: {e}")),
                };

                if let Some(reason) = failure {
                    error!("telegram {reason} (retry in {backoff_secs}s)");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                    }
                    backoff_secs = (backoff_secs * 2).min(60);
                }
            }
            info!("telegram long polling stopped");
        });

        rx
    }
}

/// Reduce an update to what the dispatcher needs. Group chats, non-text
/// messages, and updates without a sender are dropped.
pub(crate) fn update_to_incoming(update: TgUpdate) -> Option<IncomingMessage> {
    if let Some(query) = update.callback_query {
        let chat_id = query
            .message
            .as_ref()
            .map(|m| m.chat.id)
            .unwrap_or(query.from.id);
        return Some(IncomingMessage {
            operator_id: query.from.id,
            chat_id,
            text: query.data.unwrap_or_default(),
            callback: Some(CallbackInfo {
                id: query.id,
                message_id: query.message.map(|m| m.message_id),
            }),
        });
    }

    let msg = update.message?;
    if matches!(msg.chat.chat_type.as_str(), "group" | "supergroup" | "channel") {
        debug!("telegram: ignoring message from chat {}", msg.chat.id);
        return None;
    }
    let user = msg.from?;
    let text = msg.text?;
    Some(IncomingMessage {
        operator_id: user.id,
        chat_id: msg.chat.id,
        text,
        callback: None,
    })
}
