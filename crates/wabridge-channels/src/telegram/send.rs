//! Outbound Bot API calls and the `Notifier` implementation.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use wabridge_core::{
    format::truncate_chars,
    message::{InlineButton, OutgoingMessage},
    traits::Notifier,
    BridgeError,
};

use super::types::{TgInlineKeyboard, TgResponse, TgSentMessage, TgUser};
use super::{TelegramChannel, MAX_MESSAGE_LEN};

impl TelegramChannel {
    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: &Value,
    ) -> Result<TgResponse<T>, BridgeError> {
        self.client
            .post(self.url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| BridgeError::Channel(format!("telegram {method} failed: {e}")))?
            .json()
            .await
            .map_err(|e| BridgeError::Channel(format!("telegram {method} parse failed: {e}")))
    }

    /// Send one chunk as Markdown, retrying as plain text when Telegram
    /// rejects the entities.
    async fn send_chunk(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: &[Vec<InlineButton>],
    ) -> Result<i64, BridgeError> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
            "disable_web_page_preview": true,
        });
        if !keyboard.is_empty() {
            body["reply_markup"] = serde_json::to_value(TgInlineKeyboard {
                inline_keyboard: keyboard,
            })?;
        }

        let resp: TgResponse<TgSentMessage> = self.call("sendMessage", &body).await?;
        if let (true, Some(sent)) = (resp.ok, resp.result) {
            return Ok(sent.message_id);
        }
        let description = resp.description.unwrap_or_default();
        if !description.contains("can't parse entities") {
            return Err(BridgeError::Channel(format!("sendMessage: {description}")));
        }

        debug!("Markdown parse failed, retrying as plain text");
        if let Some(obj) = body.as_object_mut() {
            obj.remove("parse_mode");
        }
        let resp: TgResponse<TgSentMessage> = self.call("sendMessage", &body).await?;
        match resp.result {
            Some(sent) if resp.ok => Ok(sent.message_id),
            _ => Err(BridgeError::Channel(format!(
                "sendMessage (plain): {}",
                resp.description.unwrap_or_default()
            ))),
        }
    }

    /// Acknowledge a button press so the client stops its spinner.
    pub async fn answer_callback(&self, callback_id: &str, text: Option<&str>) {
        let mut body = json!({ "callback_query_id": callback_id });
        if let Some(text) = text {
            body["text"] = json!(truncate_chars(text, 200));
        }
        match self.call::<bool>("answerCallbackQuery", &body).await {
            Ok(resp) if resp.ok => {}
            Ok(resp) => warn!(
                "answerCallbackQuery rejected: {}",
                resp.description.unwrap_or_default()
            ),
            Err(e) => warn!("{e}"),
        }
    }

    /// Check the token with `getMe`; returns the bot's username.
    pub async fn get_me(&self) -> Result<String, BridgeError> {
        let resp: TgResponse<TgUser> = self.call("getMe", &json!({})).await?;
        match (resp.ok, resp.result) {
            (true, Some(user)) => Ok(user.username.unwrap_or_else(|| user.id.to_string())),
            _ => Err(BridgeError::Config(format!(
                "telegram token rejected: {}",
                resp.description.unwrap_or_default()
            ))),
        }
    }

    /// Register the command menu. Best-effort.
    pub async fn register_commands(&self, commands: &[(&str, &str)]) {
        let list: Vec<Value> = commands
            .iter()
            .map(|(command, description)| json!({ "command": command, "description": description }))
            .collect();
        match self
            .call::<bool>("setMyCommands", &json!({ "commands": list }))
            .await
        {
            Ok(resp) if resp.ok => info!("registered {} Telegram bot commands", list.len()),
            Ok(resp) => warn!(
                "failed to register Telegram bot commands: {}",
                resp.description.unwrap_or_default()
            ),
            Err(e) => warn!("failed to register Telegram bot commands: {e}"),
        }
    }
}

#[async_trait]
impl Notifier for TelegramChannel {
    /// Long texts are split; the keyboard rides on the last chunk, whose id
    /// is returned.
    async fn send(&self, message: OutgoingMessage) -> Result<i64, BridgeError> {
        let chunks = split_message(&message.text, MAX_MESSAGE_LEN);
        let last = chunks.len() - 1;
        let mut id = 0;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let keyboard: &[Vec<InlineButton>] = if i == last { &message.keyboard } else { &[] };
            id = self.send_chunk(message.chat_id, chunk, keyboard).await?;
        }
        Ok(id)
    }

    async fn edit(&self, message_id: i64, message: OutgoingMessage) -> Result<(), BridgeError> {
        let markup = serde_json::to_value(TgInlineKeyboard {
            inline_keyboard: &message.keyboard,
        })?;
        let body = json!({
            "chat_id": message.chat_id,
            "message_id": message_id,
            "text": truncate_chars(&message.text, MAX_MESSAGE_LEN),
            "disable_web_page_preview": true,
            "reply_markup": markup,
        });
        let resp: TgResponse<Value> = self.call("editMessageText", &body).await?;
        if resp.ok {
            return Ok(());
        }
        let description = resp.description.unwrap_or_default();
        // Progress edits often repeat the previous text.
        if description.contains("message is not modified") {
            return Ok(());
        }
        Err(BridgeError::Channel(format!("editMessageText: {description}")))
    }

    async fn delete(&self, chat_id: i64, message_id: i64) -> Result<(), BridgeError> {
        let body = json!({ "chat_id": chat_id, "message_id": message_id });
        let resp: TgResponse<bool> = self.call("deleteMessage", &body).await?;
        if resp.ok {
            Ok(())
        } else {
            Err(BridgeError::Channel(format!(
                "deleteMessage: {}",
                resp.description.unwrap_or_default()
            )))
        }
    }
}

/// Split a long message into chunks within Telegram's limit, preferring
/// line breaks. Never splits inside a UTF-8 character.
pub fn split_message(text: &str, max_len: usize) -> Vec<&str> {
    if text.len() <= max_len {
        return vec![text];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        let break_at = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .map(|i| start + i + 1)
                .unwrap_or(end)
        } else {
            end
        };
        chunks.push(&text[start..break_at]);
        start = break_at;
    }

    chunks
}
