//! Update dispatch: authorization, callbacks, and the account commands.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};
use wabridge_accounts::{pairing::CANCEL_CALLBACK, OperatorContext};
use wabridge_core::{
    format::{render_bridge_error, truncate_chars},
    message::IncomingMessage,
    AccountId, BridgeError, OperatorId,
};
use wabridge_store::{backup::backup_account, BotStore};

use super::{Gateway, JobKind};
use crate::commands::{help_text, Command};

/// Most groups listed by `/groups`.
const GROUP_LIST_LIMIT: usize = 50;
/// Entries shown by `/logs`.
const LOG_LIMIT: i64 = 15;

const RETRY_PREFIX: &str = "pair:retry:";

impl Gateway {
    /// Handle one inbound update end to end.
    pub(super) async fn dispatch(self: &Arc<Self>, incoming: IncomingMessage) {
        let operator_id = incoming.operator_id;
        if !self.config.is_allowed(operator_id) {
            warn!("ignoring update from unauthorized user {operator_id}");
            self.reply(incoming.chat_id, "⛔ You are not allowed to use this bot.")
                .await;
            return;
        }

        if let Some(callback) = &incoming.callback {
            if let Some(telegram) = &self.telegram {
                telegram.answer_callback(&callback.id, None).await;
            }
            self.handle_callback(operator_id, incoming.chat_id, &incoming.text)
                .await;
            return;
        }

        match Command::parse(&incoming.text) {
            Some(command) => self.handle_command(operator_id, incoming.chat_id, command).await,
            None => {
                self.reply(incoming.chat_id, "Unknown command. Send /help for the list.")
                    .await
            }
        }
    }

    async fn handle_callback(self: &Arc<Self>, operator_id: OperatorId, chat_id: i64, data: &str) {
        if data == CANCEL_CALLBACK {
            self.cancel(operator_id, chat_id).await;
        } else if let Some(phone) = data.strip_prefix(RETRY_PREFIX) {
            self.start_pairing(operator_id, chat_id, phone.to_string());
        } else {
            warn!("unknown callback data from {operator_id}: {data}");
        }
    }

    pub(super) async fn handle_command(
        self: &Arc<Self>,
        operator_id: OperatorId,
        chat_id: i64,
        command: Command,
    ) {
        let ctx = OperatorContext::new(self.manager.clone(), operator_id);
        match command {
            Command::Start | Command::Help => self.reply(chat_id, help_text()).await,
            Command::Status => self.reply(chat_id, self.status_text(&ctx).await).await,
            Command::Pair(raw) if raw.trim().is_empty() => {
                self.reply(chat_id, "Usage: /pair <phone>, e.g. /pair +62 812 3456 7890")
                    .await
            }
            Command::Pair(raw) => self.start_pairing(operator_id, chat_id, raw),
            Command::Cancel => self.cancel(operator_id, chat_id).await,
            Command::Accounts => self.reply(chat_id, accounts_text(&ctx).await).await,
            Command::Switch(raw) => {
                let result = match parse_account_id(&raw) {
                    Ok(id) => ctx.switch(id).await.map(|()| id),
                    Err(e) => Err(e),
                };
                let text = match result {
                    Ok(id) => {
                        info!("operator {operator_id} switched to account {id}");
                        format!("✅ Account #{id} is now current.")
                    }
                    Err(e) => render_bridge_error("Switching account", &e),
                };
                self.reply(chat_id, text).await;
            }
            Command::Remove(raw) => {
                let result = match parse_account_id(&raw) {
                    Ok(id) => ctx.remove(id).await.map(|removed| (id, removed)),
                    Err(e) => Err(e),
                };
                let text = match result {
                    Ok((id, true)) => format!("🗑 Account #{id} removed."),
                    Ok((id, false)) => format!("Account #{id} was already gone."),
                    Err(e) => render_bridge_error("Removing account", &e),
                };
                self.reply(chat_id, text).await;
            }
            Command::Sync => {
                let active = self.manager.sync_all().await;
                let groups = self.manager.refresh_groups_all().await;
                self.reply(
                    chat_id,
                    format!("🔄 {active} account(s) active, {groups} group(s) cached."),
                )
                .await;
            }
            Command::Groups(query) => {
                let text = match self.groups_text(&ctx, query.as_deref()).await {
                    Ok(text) => text,
                    Err(e) => render_bridge_error("Listing groups", &e),
                };
                self.reply(chat_id, text).await;
            }
            Command::Logs => {
                let text = match self.logs_text(operator_id).await {
                    Ok(text) => text,
                    Err(e) => render_bridge_error("Reading activity", &e),
                };
                self.reply(chat_id, text).await;
            }
            Command::Backup => {
                let text = match self.backup(&ctx).await {
                    Ok(name) => format!("💾 Backup written: {name}"),
                    Err(e) => render_bridge_error("Backing up account", &e),
                };
                self.reply(chat_id, text).await;
            }
            Command::Bulk { kind, args, items } => {
                let gw = self.clone();
                tokio::spawn(async move {
                    gw.run_bulk(ctx, chat_id, kind, args, items).await;
                });
            }
        }
    }

    /// Start a pairing on its own task.
    fn start_pairing(self: &Arc<Self>, operator_id: OperatorId, chat_id: i64, phone: String) {
        let gw = self.clone();
        tokio::spawn(async move {
            let Some(token) = gw.begin_job(operator_id, JobKind::Pairing) else {
                gw.reply(chat_id, "A job is already running. Send /cancel first.")
                    .await;
                return;
            };
            let result = gw.pairing.pair(operator_id, &phone, token).await;
            gw.end_job(operator_id);
            match result {
                // Already reported on the pairing card.
                Ok(_) | Err(BridgeError::Cancelled) | Err(BridgeError::PairTimeout(_)) => {}
                Err(e) => {
                    gw.reply(chat_id, render_bridge_error(&format!("Pairing {phone}"), &e))
                        .await
                }
            }
        });
    }

    async fn cancel(&self, operator_id: OperatorId, chat_id: i64) {
        match self.cancel_job(operator_id) {
            Some(JobKind::Pairing) => {}
            Some(JobKind::Bulk) => self.reply(chat_id, "⏹ Stopping the bulk job…").await,
            None => self.reply(chat_id, "Nothing to cancel.").await,
        }
    }

    async fn status_text(&self, ctx: &OperatorContext) -> String {
        let sessions = self.manager.sessions().await;
        let connected = sessions.iter().filter(|s| s.connected).count();
        let current = match self.manager.current().await {
            Some(id) => format!("#{id}"),
            None => "none".to_string(),
        };
        let uptime = self.started.elapsed().as_secs();
        let running = self
            .lock_jobs()
            .get(&ctx.operator_id)
            .map(|job| format!("{:?}", job.kind).to_lowercase());
        let mut text = format!(
            "📊 *Bridge status*\n\
             Uptime: {}h {}m\n\
             Accounts: {} ({} connected), limit {}\n\
             Current: {current}\n\
             Yours: {}",
            uptime / 3600,
            (uptime % 3600) / 60,
            sessions.len(),
            connected,
            self.manager.max_accounts(),
            ctx.accounts().await.len(),
        );
        if let Some(job) = running {
            text.push_str(&format!("\nRunning job: {job}"));
        }
        text
    }

    async fn groups_text(
        &self,
        ctx: &OperatorContext,
        query: Option<&str>,
    ) -> Result<String, BridgeError> {
        let target = ctx.target().await?;
        let store = BotStore::open_existing(Path::new(&target.account.bot_db_path)).await?;
        let groups = store.list_groups(query).await;
        store.close().await;
        let groups = groups?;
        if groups.is_empty() {
            return Ok(format!(
                "No cached groups for account #{}. Try /sync.",
                target.account.id
            ));
        }
        let mut text = format!(
            "👥 {} group(s) on account #{}:\n",
            groups.len(),
            target.account.id
        );
        for group in groups.iter().take(GROUP_LIST_LIMIT) {
            text.push_str(&format!(
                "\n• {} — `{}`",
                truncate_chars(&group.group_name, 40),
                group.group_jid
            ));
        }
        if groups.len() > GROUP_LIST_LIMIT {
            text.push_str(&format!("\n…and {} more", groups.len() - GROUP_LIST_LIMIT));
        }
        Ok(text)
    }

    async fn logs_text(&self, operator_id: OperatorId) -> Result<String, BridgeError> {
        let entries = match self.manager.pools().bot_store().await {
            Ok(store) => store.recent_activity(operator_id, LOG_LIMIT).await?,
            Err(_) => {
                self.manager
                    .catalog()
                    .recent_activity(operator_id, LOG_LIMIT)
                    .await?
            }
        };
        if entries.is_empty() {
            return Ok("No activity yet.".into());
        }
        let mut text = String::from("📜 Recent activity:\n");
        for entry in entries {
            let mark = if entry.success { "✅" } else { "❌" };
            text.push_str(&format!(
                "\n{mark} {} {} — {}",
                entry.created_at,
                entry.action,
                truncate_chars(&entry.description, 60)
            ));
        }
        Ok(text)
    }

    async fn backup(&self, ctx: &OperatorContext) -> Result<String, BridgeError> {
        let target = ctx.target().await?;
        let account = &target.account;
        let path = backup_account(
            Path::new(&account.upstream_db_path),
            &self.manager.paths().backup_dir(),
            &account.phone,
            account.id,
        )
        .await?;
        Ok(path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string()))
    }
}

async fn accounts_text(ctx: &OperatorContext) -> String {
    let accounts = ctx.accounts().await;
    if accounts.is_empty() {
        return "No accounts yet. Pair one with /pair <phone>.".into();
    }
    let mut text = String::from("📱 Your accounts:\n");
    for s in accounts {
        let dot = if s.connected { "🟢" } else { "⚪" };
        let star = if s.current { " ⭐" } else { "" };
        text.push_str(&format!(
            "\n{dot} #{} +{} — {} ({}){star}",
            s.account_id,
            s.phone,
            s.status.as_str(),
            s.phase.as_str()
        ));
    }
    text
}

pub(super) fn parse_account_id(raw: &str) -> Result<AccountId, BridgeError> {
    raw.trim()
        .trim_start_matches('#')
        .parse::<AccountId>()
        .map_err(|_| BridgeError::Validation(format!("not an account id: '{}'", raw.trim())))
}
