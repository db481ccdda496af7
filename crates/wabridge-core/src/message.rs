//! Shared value types: identifiers, upstream events, group data, and the
//! Telegram-facing message shapes.

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Catalog key of a paired WhatsApp account.
pub type AccountId = i64;

/// Telegram user id of the operator driving the bot.
pub type OperatorId = i64;

/// Events surfaced by the upstream WhatsApp client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaEvent {
    Connected,
    Disconnected,
    LoggedOut,
    PairSuccess,
    /// A message arrived. `group_jid` is set for group chats.
    Message {
        group_jid: Option<String>,
        group_name: Option<String>,
        sender: String,
        text: String,
        from_me: bool,
    },
}

/// Group metadata as returned by the upstream service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub jid: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub participants: usize,
    #[serde(default)]
    pub is_admin: bool,
}

/// Membership changes for `update_participants`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantAction {
    Add,
    Remove,
    Promote,
    Demote,
}

impl ParticipantAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Promote => "promote",
            Self::Demote => "demote",
        }
    }
}

/// An inbound Telegram update, already reduced to what the dispatcher needs.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub operator_id: OperatorId,
    pub chat_id: i64,
    pub text: String,
    /// Set when the update came from an inline keyboard button.
    pub callback: Option<CallbackInfo>,
}

/// Callback query details, needed to answer and edit the originating message.
#[derive(Debug, Clone)]
pub struct CallbackInfo {
    pub id: String,
    pub message_id: Option<i64>,
}

/// One inline keyboard button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

impl InlineButton {
    pub fn new(text: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            callback_data: callback_data.into(),
        }
    }
}

/// An outbound Telegram message.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub chat_id: i64,
    pub text: String,
    /// Rows of inline buttons; empty means no keyboard.
    pub keyboard: Vec<Vec<InlineButton>>,
}

impl OutgoingMessage {
    pub fn text(chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
            keyboard: Vec::new(),
        }
    }

    pub fn with_keyboard(mut self, keyboard: Vec<Vec<InlineButton>>) -> Self {
        self.keyboard = keyboard;
        self
    }
}

/// Strip everything but digits from a phone number (`+62 812-3456` → `628123456`).
///
/// Rejects numbers outside the E.164 length range.
pub fn normalize_phone(raw: &str) -> Result<String, BridgeError> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if raw.chars().any(|c| c.is_alphabetic()) {
        return Err(BridgeError::Validation(format!(
            "phone number contains letters: {raw}"
        )));
    }
    if !(8..=15).contains(&digits.len()) {
        return Err(BridgeError::Validation(format!(
            "phone number must have 8-15 digits, got {}",
            digits.len()
        )));
    }
    Ok(digits)
}

/// Extract the invite code from a `chat.whatsapp.com` link.
pub fn parse_invite_link(link: &str) -> Result<String, BridgeError> {
    let trimmed = link.trim().trim_end_matches('/');
    let rest = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    let code = rest
        .strip_prefix("chat.whatsapp.com/")
        .ok_or_else(|| BridgeError::Validation(format!("not a WhatsApp invite link: {link}")))?;
    let code = code.split(['?', '#']).next().unwrap_or_default();
    if code.len() < 10 || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(BridgeError::Validation(format!(
            "malformed invite code in link: {link}"
        )));
    }
    Ok(code.to_string())
}

/// Turn a bare phone number into a user JID; JIDs pass through unchanged.
pub fn to_user_jid(raw: &str) -> Result<String, BridgeError> {
    if raw.contains('@') {
        return Ok(raw.to_string());
    }
    Ok(format!("{}@s.whatsapp.net", normalize_phone(raw)?))
}

/// Whether a JID addresses a group.
pub fn is_group_jid(jid: &str) -> bool {
    jid.ends_with("@g.us")
}
