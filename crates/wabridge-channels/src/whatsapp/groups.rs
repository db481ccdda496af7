//! Group operations over a connected `whatsapp-rust` client.

use std::sync::Arc;

use wabridge_core::{
    classify::upstream_error,
    message::{GroupInfo, ParticipantAction},
    BridgeError,
};
use wacore_binary::jid::Jid;
use whatsapp_rust::client::Client;

pub(crate) fn parse_jid(raw: &str) -> Result<Jid, BridgeError> {
    let raw = raw.trim();
    let full = if raw.contains('@') {
        raw.to_string()
    } else {
        format!("{}@s.whatsapp.net", raw.trim_start_matches('+'))
    };
    full.parse()
        .map_err(|e| BridgeError::Validation(format!("invalid JID '{raw}': {e}")))
}

fn up(e: impl std::fmt::Display) -> BridgeError {
    upstream_error(e.to_string())
}

pub(crate) async fn info(client: &Arc<Client>, jid: &str) -> Result<GroupInfo, BridgeError> {
    let jid = parse_jid(jid)?;
    let meta = client.groups().get_metadata(&jid).await.map_err(up)?;
    let own = client.get_pn().await.map(|pn| pn.user);
    let is_admin = meta
        .participants
        .iter()
        .any(|p| Some(&p.jid.user) == own.as_ref() && p.is_admin);
    Ok(GroupInfo {
        jid: jid.to_string(),
        name: meta.subject,
        description: meta.description,
        participants: meta.participants.len(),
        is_admin,
    })
}

pub(crate) async fn joined(client: &Arc<Client>) -> Result<Vec<GroupInfo>, BridgeError> {
    let groups = client.groups().get_participating().await.map_err(up)?;
    Ok(groups
        .into_values()
        .map(|meta| GroupInfo {
            jid: meta.id.to_string(),
            name: meta.subject,
            description: meta.description,
            participants: meta.participants.len(),
            is_admin: false,
        })
        .collect())
}

pub(crate) async fn set_name(client: &Arc<Client>, jid: &str, name: &str) -> Result<(), BridgeError> {
    let jid = parse_jid(jid)?;
    client.groups().set_subject(&jid, name).await.map_err(up)
}

pub(crate) async fn set_description(
    client: &Arc<Client>,
    jid: &str,
    description: &str,
) -> Result<(), BridgeError> {
    let jid = parse_jid(jid)?;
    let description = (!description.is_empty()).then_some(description);
    client
        .groups()
        .set_description(&jid, description)
        .await
        .map_err(up)
}

pub(crate) async fn join(client: &Arc<Client>, code: &str) -> Result<String, BridgeError> {
    let jid = client
        .groups()
        .join_with_invite_code(code)
        .await
        .map_err(up)?;
    Ok(jid.to_string())
}

pub(crate) async fn leave(client: &Arc<Client>, jid: &str) -> Result<(), BridgeError> {
    let jid = parse_jid(jid)?;
    client.groups().leave(&jid).await.map_err(up)
}

pub(crate) async fn participants(
    client: &Arc<Client>,
    jid: &str,
    members: &[String],
    action: ParticipantAction,
) -> Result<(), BridgeError> {
    let group = parse_jid(jid)?;
    let members = members
        .iter()
        .map(|m| parse_jid(m))
        .collect::<Result<Vec<_>, _>>()?;
    let groups = client.groups();
    let result = match action {
        ParticipantAction::Add => groups.add_participants(&group, &members).await.map(|_| ()),
        ParticipantAction::Remove => groups.remove_participants(&group, &members).await.map(|_| ()),
        ParticipantAction::Promote => groups.promote_participants(&group, &members).await,
        ParticipantAction::Demote => groups.demote_participants(&group, &members).await,
    };
    result.map_err(up)
}

pub(crate) async fn set_announce(
    client: &Arc<Client>,
    jid: &str,
    announce: bool,
) -> Result<(), BridgeError> {
    let jid = parse_jid(jid)?;
    client.groups().set_announce(&jid, announce).await.map_err(up)
}

pub(crate) async fn set_locked(client: &Arc<Client>, jid: &str, locked: bool) -> Result<(), BridgeError> {
    let jid = parse_jid(jid)?;
    client.groups().set_locked(&jid, locked).await.map_err(up)
}

pub(crate) async fn invite_link(
    client: &Arc<Client>,
    jid: &str,
    reset: bool,
) -> Result<String, BridgeError> {
    let jid = parse_jid(jid)?;
    let code = client
        .groups()
        .get_invite_link(&jid, reset)
        .await
        .map_err(up)?;
    if code.starts_with("https://") {
        Ok(code)
    } else {
        Ok(format!("https://chat.whatsapp.com/{code}"))
    }
}
