//! Upstream event translation.

use wabridge_core::message::WaEvent;
use wacore::types::events::Event;
use waproto::whatsapp::Message;

/// Text of a message, looking through device-sent, ephemeral and view-once
/// wrappers. `None` for media without a caption or empty text.
pub fn message_text(msg: &Message) -> Option<String> {
    let inner = msg
        .device_sent_message
        .as_ref()
        .and_then(|d| d.message.as_deref())
        .or_else(|| {
            msg.ephemeral_message
                .as_ref()
                .and_then(|e| e.message.as_deref())
        })
        .or_else(|| {
            msg.view_once_message
                .as_ref()
                .and_then(|v| v.message.as_deref())
        })
        .unwrap_or(msg);

    inner
        .conversation
        .as_deref()
        .or_else(|| {
            inner
                .extended_text_message
                .as_ref()
                .and_then(|e| e.text.as_deref())
        })
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// What a connection-level event means for the client's own state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Connected,
    Disconnected,
    LoggedOut,
    Paired,
    PairingCode(String),
    Other,
}

pub(crate) fn lifecycle(event: &Event) -> Lifecycle {
    match event {
        Event::Connected(_) => Lifecycle::Connected,
        Event::Disconnected(_) => Lifecycle::Disconnected,
        Event::LoggedOut(_) => Lifecycle::LoggedOut,
        Event::PairSuccess(_) => Lifecycle::Paired,
        Event::PairingCode { code, .. } => Lifecycle::PairingCode(code.clone()),
        _ => Lifecycle::Other,
    }
}

/// Map an upstream event onto the bridge's event, if it is one the
/// reactor cares about.
pub(crate) fn to_wa_event(event: &Event) -> Option<WaEvent> {
    match lifecycle(event) {
        Lifecycle::Connected => return Some(WaEvent::Connected),
        Lifecycle::Disconnected => return Some(WaEvent::Disconnected),
        Lifecycle::LoggedOut => return Some(WaEvent::LoggedOut),
        Lifecycle::Paired => return Some(WaEvent::PairSuccess),
        Lifecycle::PairingCode(_) | Lifecycle::Other => {}
    }
    let Event::Message(msg, info) = event else {
        return None;
    };
    let text = message_text(msg)?;
    let source = &info.source;
    Some(WaEvent::Message {
        group_jid: source.is_group.then(|| source.chat.to_string()),
        group_name: None,
        sender: source.sender.user.clone(),
        text,
        from_me: source.is_from_me,
    })
}
