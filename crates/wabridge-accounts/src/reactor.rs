//! Per-client event tasks.
//!
//! Each upstream client gets one task that drains its event channel. The
//! task never calls into the manager: lifecycle events become [`Intent`]s
//! on a channel the manager consumes, and message events only touch the
//! account's own bot-data store.

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use wabridge_core::{
    classify::{classify_error, ErrorClass},
    message::WaEvent,
    traits::WaClient,
    AccountId, BridgeError,
};
use wabridge_store::BotStore;

use crate::session::{EventRoute, Timings};

/// What the manager should do in response to an upstream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// The client came up; mark the account active.
    Connected(AccountId),
    /// The client went down. `logged_out` means it will never come back.
    Disconnected {
        account_id: AccountId,
        logged_out: bool,
    },
    /// An upstream call failed in a way the account cannot recover from.
    AuthFatal { account_id: AccountId, reason: String },
}

/// Send an [`Intent::AuthFatal`] when `err` classifies as auth-fatal.
/// Returns whether it did.
pub fn escalate(
    intents: &mpsc::UnboundedSender<Intent>,
    account_id: AccountId,
    err: &BridgeError,
) -> bool {
    if classify_error(err) != ErrorClass::AuthFatal {
        return false;
    }
    let reason = err.to_string();
    warn!("account {account_id}: auth-fatal upstream error: {reason}");
    if intents
        .send(Intent::AuthFatal { account_id, reason })
        .is_err()
    {
        debug!("intent channel closed; dropping auth-fatal for {account_id}");
    }
    true
}

/// Fetch every joined group and write it to the cache. Silently skips a
/// client that is not connected.
pub async fn cache_joined_groups(
    client: &dyn WaClient,
    store: &BotStore,
    timings: &Timings,
) -> Result<usize, BridgeError> {
    if !client.is_connected() {
        return Ok(0);
    }
    let groups = tokio::time::timeout(timings.groups_fetch_timeout, client.joined_groups())
        .await
        .map_err(|_| BridgeError::Transient("joined groups fetch timed out".into()))??;
    store.upsert_groups(&groups).await
}

pub(crate) struct Reactor {
    pub client: Weak<dyn WaClient>,
    pub route: EventRoute,
    pub intents: mpsc::UnboundedSender<Intent>,
    pub bot_db_path: Option<PathBuf>,
    pub timings: Timings,
}

impl Reactor {
    pub fn spawn(self, events: mpsc::UnboundedReceiver<WaEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    async fn run(self, mut events: mpsc::UnboundedReceiver<WaEvent>) {
        let mut store: Option<BotStore> = None;
        let mut last_refresh: Option<Instant> = None;

        while let Some(event) = events.recv().await {
            let account_id = self.route.get();
            match event {
                WaEvent::Connected => self.emit(account_id.map(Intent::Connected)),
                WaEvent::Disconnected => self.emit(account_id.map(|account_id| {
                    Intent::Disconnected {
                        account_id,
                        logged_out: false,
                    }
                })),
                WaEvent::LoggedOut => self.emit(account_id.map(|account_id| {
                    Intent::Disconnected {
                        account_id,
                        logged_out: true,
                    }
                })),
                // Pairing reports its own success.
                WaEvent::PairSuccess => debug!("pair success event ignored by reactor"),
                WaEvent::Message {
                    group_jid: Some(jid),
                    group_name,
                    sender,
                    text,
                    from_me: false,
                } => {
                    let Some(account_id) = account_id else {
                        continue;
                    };
                    let Some(bot) = self.store(&mut store).await else {
                        continue;
                    };
                    self.on_group_message(account_id, &bot, &jid, group_name, &sender, &text)
                        .await;

                    let due = last_refresh
                        .map(|t| t.elapsed() >= self.timings.groups_refresh_gap)
                        .unwrap_or(true);
                    if due {
                        last_refresh = Some(Instant::now());
                        self.spawn_refresh(account_id, bot);
                    }
                }
                WaEvent::Message { .. } => {}
            }
        }
        debug!("reactor for {:?} finished", self.route.get());
    }

    fn emit(&self, intent: Option<Intent>) {
        if let Some(intent) = intent {
            if self.intents.send(intent).is_err() {
                debug!("intent channel closed");
            }
        }
    }

    async fn store(&self, slot: &mut Option<BotStore>) -> Option<BotStore> {
        if let Some(store) = slot {
            return Some(store.clone());
        }
        let path = self.bot_db_path.as_ref()?;
        match BotStore::open_existing(path).await {
            Ok(store) => {
                *slot = Some(store.clone());
                Some(store)
            }
            Err(e) => {
                warn!("group cache unavailable at {}: {e}", path.display());
                None
            }
        }
    }

    async fn on_group_message(
        &self,
        account_id: AccountId,
        store: &BotStore,
        jid: &str,
        group_name: Option<String>,
        sender: &str,
        text: &str,
    ) {
        let name = match group_name {
            Some(name) => name,
            None => self.lookup_name(account_id, jid).await,
        };
        if let Err(e) = store.upsert_group(jid, &name).await {
            warn!("group cache upsert failed for {jid}: {e}");
        }
        if let Err(e) = store.log_message(sender, text).await {
            warn!("message log failed: {e}");
        }
    }

    async fn lookup_name(&self, account_id: AccountId, jid: &str) -> String {
        let Some(client) = self.client.upgrade() else {
            return jid.to_string();
        };
        match tokio::time::timeout(self.timings.group_info_timeout, client.group_info(jid)).await
        {
            Ok(Ok(info)) => info.name,
            Ok(Err(e)) => {
                escalate(&self.intents, account_id, &e);
                jid.to_string()
            }
            Err(_) => jid.to_string(),
        }
    }

    fn spawn_refresh(&self, account_id: AccountId, store: BotStore) {
        let Some(client) = self.client.upgrade() else {
            return;
        };
        let intents = self.intents.clone();
        let timings = self.timings.clone();
        tokio::spawn(async move {
            refresh(client, account_id, store, intents, timings).await;
        });
    }
}

async fn refresh(
    client: Arc<dyn WaClient>,
    account_id: AccountId,
    store: BotStore,
    intents: mpsc::UnboundedSender<Intent>,
    timings: Timings,
) {
    match cache_joined_groups(client.as_ref(), &store, &timings).await {
        Ok(n) => debug!("account {account_id}: cached {n} groups"),
        Err(e) => {
            if !escalate(&intents, account_id, &e) {
                debug!("account {account_id}: group refresh skipped: {e}");
            }
        }
    }
}
