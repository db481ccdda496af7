//! Bulk group features on top of the bulk executor.
//!
//! Each command is first planned (items parsed and validated against the
//! group cache, nothing sent), then executed against the operator's target
//! account with a Telegram message edited in place as progress.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tracing::{debug, info, warn};
use wabridge_accounts::{
    BulkExecutor, BulkProgress, BulkSummary, Intent, OperatorContext, ProgressSink,
};
use wabridge_core::{
    format::{render_bridge_error, render_progress, sanitize_detail},
    message::{is_group_jid, parse_invite_link, to_user_jid, OutgoingMessage, ParticipantAction},
    traits::{Notifier, WaClient},
    BridgeError,
};
use wabridge_store::{bot_data::CachedGroup, stats, ActivityEntry, BotStore};

use super::{Gateway, JobKind};
use crate::commands::{parse_toggle, split_pair, BulkKind};

/// Failures listed in the final report.
const FAILURE_LIST_LIMIT: usize = 10;

/// One unit of bulk work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BulkItem {
    Group(String),
    Named { jid: String, value: String },
    Invite(String),
}

/// Parameter shared by every item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BulkParam {
    None,
    Text(String),
    Members(Vec<String>),
    Toggle(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BulkPlan {
    pub kind: BulkKind,
    pub param: BulkParam,
    pub items: Vec<BulkItem>,
    /// Input lines that could not be used, with the reason.
    pub rejected: Vec<String>,
}

/// Resolve a group reference: a group JID, a bare group id, or the exact
/// (case-insensitive) name of a cached group.
pub(crate) fn resolve_group(raw: &str, cached: &[CachedGroup]) -> Result<String, BridgeError> {
    let raw = raw.trim();
    if raw.contains('@') {
        return if is_group_jid(raw) {
            Ok(raw.to_string())
        } else {
            Err(BridgeError::Validation(format!("not a group JID: {raw}")))
        };
    }
    if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit() || c == '-') {
        return Ok(format!("{raw}@g.us"));
    }
    cached
        .iter()
        .find(|g| g.group_name.eq_ignore_ascii_case(raw))
        .map(|g| g.group_jid.clone())
        .ok_or_else(|| BridgeError::Validation(format!("unknown group: {raw}")))
}

/// Parse a bulk command into work items. Fails when nothing usable remains
/// or the shared parameter is missing.
pub(crate) fn plan(
    kind: BulkKind,
    args: &str,
    lines: &[String],
    cached: &[CachedGroup],
) -> Result<BulkPlan, BridgeError> {
    let param = match kind {
        BulkKind::Broadcast => {
            if args.is_empty() {
                return Err(BridgeError::Validation(
                    "usage: /broadcast <text>, groups on the following lines".into(),
                ));
            }
            BulkParam::Text(args.to_string())
        }
        BulkKind::Add | BulkKind::Kick | BulkKind::Promote | BulkKind::Demote => {
            let members = args
                .split([',', ' '])
                .filter(|s| !s.trim().is_empty())
                .map(to_user_jid)
                .collect::<Result<Vec<_>, _>>()?;
            if members.is_empty() {
                return Err(BridgeError::Validation(
                    "list the phone numbers after the command, groups on the following lines"
                        .into(),
                ));
            }
            BulkParam::Members(members)
        }
        BulkKind::Announce | BulkKind::Lock => BulkParam::Toggle(
            parse_toggle(args)
                .ok_or_else(|| BridgeError::Validation("say on or off".into()))?,
        ),
        BulkKind::Rename | BulkKind::Describe | BulkKind::Join | BulkKind::Leave | BulkKind::Links => {
            BulkParam::None
        }
    };

    let mut items = Vec::new();
    let mut rejected = Vec::new();
    for line in lines {
        let parsed = match kind {
            BulkKind::Join => parse_invite_link(line).map(BulkItem::Invite),
            BulkKind::Rename | BulkKind::Describe => match split_pair(line) {
                Some((group, value)) => {
                    if kind == BulkKind::Rename && value.is_empty() {
                        Err(BridgeError::Validation("empty group name".into()))
                    } else {
                        resolve_group(group, cached).map(|jid| BulkItem::Named {
                            jid,
                            value: value.to_string(),
                        })
                    }
                }
                None => Err(BridgeError::Validation("expected `<group> | <value>`".into())),
            },
            _ => resolve_group(line, cached).map(BulkItem::Group),
        };
        match parsed {
            Ok(item) => items.push(item),
            Err(e) => rejected.push(format!("{line}: {e}")),
        }
    }

    if lines.is_empty() && kind.defaults_to_all_groups() {
        items = cached
            .iter()
            .map(|g| BulkItem::Group(g.group_jid.clone()))
            .collect();
    }
    if items.is_empty() {
        return Err(BridgeError::Validation(if rejected.is_empty() {
            "no items: put one per line after the command".into()
        } else {
            format!("no usable items ({} rejected)", rejected.len())
        }));
    }
    Ok(BulkPlan {
        kind,
        param,
        items,
        rejected,
    })
}

/// Run one item against the client. Invite links found are pushed to `links`.
async fn apply(
    client: &dyn WaClient,
    param: &BulkParam,
    kind: BulkKind,
    item: BulkItem,
    links: &StdMutex<Vec<(String, String)>>,
) -> Result<(), BridgeError> {
    match (kind, item, param) {
        (BulkKind::Rename, BulkItem::Named { jid, value }, _) => {
            client.set_group_name(&jid, &value).await
        }
        (BulkKind::Describe, BulkItem::Named { jid, value }, _) => {
            client.set_group_description(&jid, &value).await
        }
        (BulkKind::Join, BulkItem::Invite(code), _) => {
            let jid = client.join_group_with_link(&code).await?;
            debug!("joined {jid}");
            Ok(())
        }
        (BulkKind::Leave, BulkItem::Group(jid), _) => client.leave_group(&jid).await,
        (BulkKind::Broadcast, BulkItem::Group(jid), BulkParam::Text(text)) => {
            client.send_text(&jid, text).await.map(|_| ())
        }
        (kind, BulkItem::Group(jid), BulkParam::Members(members)) => {
            let action = match kind {
                BulkKind::Add => ParticipantAction::Add,
                BulkKind::Kick => ParticipantAction::Remove,
                BulkKind::Promote => ParticipantAction::Promote,
                _ => ParticipantAction::Demote,
            };
            client.update_participants(&jid, members, action).await
        }
        (BulkKind::Announce, BulkItem::Group(jid), BulkParam::Toggle(on)) => {
            client.set_group_announce(&jid, *on).await
        }
        (BulkKind::Lock, BulkItem::Group(jid), BulkParam::Toggle(on)) => {
            client.set_group_locked(&jid, *on).await
        }
        (BulkKind::Links, BulkItem::Group(jid), _) => {
            let link = client.group_invite_link(&jid, false).await?;
            links
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((jid, link));
            Ok(())
        }
        (kind, item, _) => Err(BridgeError::Validation(format!(
            "{item:?} does not fit {}",
            kind.label()
        ))),
    }
}

/// Edits one Telegram message with each tick.
struct TelegramProgress {
    notifier: Arc<dyn Notifier>,
    chat_id: i64,
    message_id: Option<i64>,
    label: &'static str,
}

#[async_trait]
impl ProgressSink for TelegramProgress {
    async fn progress(&self, p: BulkProgress) {
        let Some(message_id) = self.message_id else {
            return;
        };
        let text = render_progress(self.label, p.current, p.total, p.updated, p.failed);
        if let Err(e) = self
            .notifier
            .edit(message_id, OutgoingMessage::text(self.chat_id, text))
            .await
        {
            debug!("progress edit failed: {e}");
        }
    }
}

/// The final report sent to the operator.
pub(crate) fn render_summary(
    plan: &BulkPlan,
    summary: &BulkSummary,
    links: &[(String, String)],
) -> String {
    let head = if summary.auth_fatal.is_some() {
        "⛔"
    } else if summary.cancelled {
        "⏹"
    } else {
        "✅"
    };
    let mut text = format!(
        "{head} {} finished: {}/{} processed, {} updated, {} failed in {:.1}s",
        plan.kind.label(),
        summary.processed,
        summary.total,
        summary.updated,
        summary.failed,
        summary.elapsed.as_secs_f64()
    );
    if summary.cancelled {
        text.push_str(&format!("\nStopped early; {} item(s) skipped.", summary.skipped()));
    }
    if let Some(reason) = &summary.auth_fatal {
        text.push_str(&format!(
            "\nThe account lost its session ({}); it will be removed.",
            sanitize_detail(reason)
        ));
    }
    if !summary.failures.is_empty() {
        text.push_str("\n\nFailures:");
        for (index, reason) in summary.failures.iter().take(FAILURE_LIST_LIMIT) {
            text.push_str(&format!("\n• {}: {}", item_label(plan.items.get(*index)), sanitize_detail(reason)));
        }
        if summary.failures.len() > FAILURE_LIST_LIMIT {
            text.push_str(&format!("\n…and {} more", summary.failures.len() - FAILURE_LIST_LIMIT));
        }
    }
    if !plan.rejected.is_empty() {
        text.push_str(&format!("\n\nIgnored {} line(s):", plan.rejected.len()));
        for line in plan.rejected.iter().take(FAILURE_LIST_LIMIT) {
            text.push_str(&format!("\n• {}", sanitize_detail(line)));
        }
    }
    if !links.is_empty() {
        text.push_str("\n\nInvite links:");
        for (jid, link) in links {
            text.push_str(&format!("\n{jid}: {link}"));
        }
    }
    text
}

fn item_label(item: Option<&BulkItem>) -> String {
    match item {
        Some(BulkItem::Group(jid)) | Some(BulkItem::Named { jid, .. }) => jid.clone(),
        Some(BulkItem::Invite(code)) => code.clone(),
        None => "?".into(),
    }
}

impl Gateway {
    pub(super) async fn run_bulk(
        self: &Arc<Self>,
        ctx: OperatorContext,
        chat_id: i64,
        kind: BulkKind,
        args: String,
        lines: Vec<String>,
    ) {
        let operator_id = ctx.operator_id;
        let Some(job) = self.begin_job(operator_id, JobKind::Bulk) else {
            self.reply(chat_id, "A job is already running. Send /cancel first.")
                .await;
            return;
        };
        if let Err(e) = self.bulk_job(&ctx, chat_id, kind, &args, &lines, job).await {
            self.reply(chat_id, render_bridge_error(kind.label(), &e)).await;
        }
        self.end_job(operator_id);
    }

    async fn bulk_job(
        &self,
        ctx: &OperatorContext,
        chat_id: i64,
        kind: BulkKind,
        args: &str,
        lines: &[String],
        job: tokio_util::sync::CancellationToken,
    ) -> Result<(), BridgeError> {
        let target = ctx.target().await?;
        let account = target.account;
        let store = BotStore::open_existing(Path::new(&account.bot_db_path)).await?;
        let cached = store.list_groups(None).await?;
        let plan = plan(kind, args, lines, &cached)?;

        let total = plan.items.len();
        let progress_id = self
            .notifier
            .send(OutgoingMessage::text(
                chat_id,
                render_progress(kind.label(), 0, total, 0, 0),
            ))
            .await
            .map_err(|e| warn!("progress message failed: {e}"))
            .ok();
        let sink = Arc::new(TelegramProgress {
            notifier: self.notifier.clone(),
            chat_id,
            message_id: progress_id,
            label: kind.label(),
        });

        let intents = self.manager.intents();
        let account_id = account.id;
        let mut config = self.bulk.clone();
        if kind == BulkKind::Join {
            // Joins are the most throttled upstream call.
            config = config.sequential();
        }
        let executor = BulkExecutor::new(config, sink).on_auth_fatal(move |reason| {
            let _ = intents.send(Intent::AuthFatal { account_id, reason });
        });

        info!(
            "operator {} started {} on account {account_id}: {total} item(s)",
            ctx.operator_id,
            kind.action()
        );
        let cancel = ctx.work_token(account_id, &job).await;
        let client = target.client;
        let param = Arc::new(plan.param.clone());
        let links = Arc::new(StdMutex::new(Vec::new()));
        let op_links = links.clone();
        let summary = executor
            .run(
                plan.items.clone(),
                move |item, _cancel| {
                    let client = client.clone();
                    let param = param.clone();
                    let links = op_links.clone();
                    async move { apply(client.as_ref(), &param, kind, item, &links).await }
                },
                cancel,
            )
            .await;

        if let Err(e) = store.increment_stat(stats::BULK_UPDATED, summary.updated as i64).await {
            warn!("stats update failed: {e}");
        }
        if let Err(e) = store.increment_stat(stats::BULK_FAILED, summary.failed as i64).await {
            warn!("stats update failed: {e}");
        }
        store.close().await;

        let description = format!(
            "{} on #{account_id}: {}/{} updated",
            kind.label(),
            summary.updated,
            summary.total
        );
        let metadata = serde_json::to_value(&summary).unwrap_or_default();
        let entry = match &summary.auth_fatal {
            None => ActivityEntry::ok(ctx.operator_id, kind.action(), description),
            Some(reason) => {
                ActivityEntry::failed(ctx.operator_id, kind.action(), description, reason.clone())
            }
        };
        self.manager.log_activity(entry.with_metadata(metadata)).await;

        let links = links.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let report = render_summary(&plan, &summary, &links);
        self.reply(chat_id, report).await;
        Ok(())
    }
}
