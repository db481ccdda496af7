use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    error::BridgeError,
    message::{GroupInfo, OperatorId, OutgoingMessage, ParticipantAction, WaEvent},
};

/// The upstream WhatsApp client, seen as a bag of capabilities.
///
/// Calls against one client are serialised by the implementation; callers
/// must not assume stronger ordering.
#[async_trait]
pub trait WaClient: Send + Sync {
    /// Open the websocket and start the event stream.
    async fn connect(&self) -> Result<(), BridgeError>;

    /// Close the connection. Never fails; errors are logged by the implementation.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Whether the device store holds an identity (`store.id != none`).
    fn has_identity(&self) -> bool;

    /// Unlink this device from the phone.
    async fn logout(&self) -> Result<(), BridgeError>;

    /// Request a pairing code for `phone` (digits only).
    async fn pair_phone(
        &self,
        phone: &str,
        show_push: bool,
        client_name: &str,
    ) -> Result<String, BridgeError>;

    async fn group_info(&self, jid: &str) -> Result<GroupInfo, BridgeError>;

    async fn joined_groups(&self) -> Result<Vec<GroupInfo>, BridgeError>;

    /// Send a text message; returns the message id.
    async fn send_text(&self, jid: &str, text: &str) -> Result<String, BridgeError>;

    async fn set_group_name(&self, jid: &str, name: &str) -> Result<(), BridgeError>;

    async fn set_group_description(&self, jid: &str, description: &str)
        -> Result<(), BridgeError>;

    /// Join through an invite code; returns the group JID.
    async fn join_group_with_link(&self, code: &str) -> Result<String, BridgeError>;

    async fn leave_group(&self, jid: &str) -> Result<(), BridgeError>;

    async fn update_participants(
        &self,
        jid: &str,
        participants: &[String],
        action: ParticipantAction,
    ) -> Result<(), BridgeError>;

    /// Only admins may send messages when `announce` is on.
    async fn set_group_announce(&self, jid: &str, announce: bool) -> Result<(), BridgeError>;

    /// Only admins may edit group info when `locked` is on.
    async fn set_group_locked(&self, jid: &str, locked: bool) -> Result<(), BridgeError>;

    /// Current invite link, optionally revoking the old one first.
    async fn group_invite_link(&self, jid: &str, reset: bool) -> Result<String, BridgeError>;
}

/// Builds clients over a device store file.
#[async_trait]
pub trait WaClientFactory: Send + Sync {
    /// Open the device store at `db_path` and construct a client whose
    /// events are pushed onto `events`. Does not connect.
    async fn create(
        &self,
        db_path: &Path,
        events: mpsc::UnboundedSender<WaEvent>,
    ) -> Result<Arc<dyn WaClient>, BridgeError>;
}

/// The Telegram side, used by the core only to talk to operators.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send a message; returns the Telegram message id.
    async fn send(&self, message: OutgoingMessage) -> Result<i64, BridgeError>;

    /// Replace the text of a message previously sent.
    async fn edit(&self, message_id: i64, message: OutgoingMessage) -> Result<(), BridgeError>;

    async fn delete(&self, chat_id: i64, message_id: i64) -> Result<(), BridgeError>;

    /// Best-effort plain notification to an operator's private chat.
    async fn notify(&self, operator_id: OperatorId, text: &str) {
        if let Err(e) = self.send(OutgoingMessage::text(operator_id, text)).await {
            tracing::warn!("notify {operator_id} failed: {e}");
        }
    }
}
