//! Pair a new account by phone number.
//!
//! A fresh client is opened over the operator's staging files
//! (`whatsapp.db` / `bot_data.db` in the operator folder), connected, and
//! asked for a pairing code. Once the phone confirms and the store holds an
//! identity, the staging files are renamed to the canonical per-account
//! names, the account is registered in the catalog, made current, and
//! reconnected from its canonical store.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wabridge_core::{
    classify::{classify, ErrorClass},
    format::render_pairing_code,
    message::{normalize_phone, InlineButton, OutgoingMessage},
    paths::{move_db_files, remove_db_files, DbKind},
    traits::WaClient,
    AccountId, BridgeError, OperatorId,
};
use wabridge_store::{ActivityEntry, BotStore};

use crate::manager::{wait_connected, AccountManager};
use crate::reactor::Reactor;
use crate::session::EventRoute;

/// Client name shown on the phone's linked-devices list.
pub const CLIENT_NAME: &str = "Chrome (Linux)";

/// Callback data of the cancel button on the pairing card.
pub const CANCEL_CALLBACK: &str = "cancel";

/// Callback data of the retry button offered after a timeout.
pub fn retry_callback(phone: &str) -> String {
    format!("pair:retry:{phone}")
}

/// Runs pairings. At most one pairing per operator at a time.
pub struct Bootstrapper {
    manager: Arc<AccountManager>,
    active: StdMutex<HashSet<OperatorId>>,
}

struct Staging {
    client: Arc<dyn WaClient>,
    reactor: JoinHandle<()>,
    upstream: PathBuf,
    bot: PathBuf,
}

impl Staging {
    async fn discard(self, logout: bool) {
        self.reactor.abort();
        if logout && self.client.has_identity() {
            if let Err(e) = self.client.logout().await {
                debug!("staging logout failed: {e}");
            }
        }
        self.client.disconnect().await;
        drop(self.client);
        for path in [&self.upstream, &self.bot] {
            if let Err(e) = remove_db_files(path) {
                warn!("cannot remove staging file {}: {e}", path.display());
            }
        }
    }
}

impl Bootstrapper {
    pub fn new(manager: Arc<AccountManager>) -> Self {
        Self {
            manager,
            active: StdMutex::new(HashSet::new()),
        }
    }

    pub fn is_pairing(&self, operator_id: OperatorId) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&operator_id)
    }

    fn begin(&self, operator_id: OperatorId) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(operator_id)
    }

    fn end(&self, operator_id: OperatorId) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&operator_id);
    }

    /// Pair `raw_phone` for `operator_id`. Progress goes to the operator's
    /// chat. Returns the new account id.
    pub async fn pair(
        &self,
        operator_id: OperatorId,
        raw_phone: &str,
        cancel: CancellationToken,
    ) -> Result<AccountId, BridgeError> {
        let phone = normalize_phone(raw_phone)?;
        self.check_capacity(&phone).await?;

        if !self.begin(operator_id) {
            return Err(BridgeError::Validation(
                "a pairing is already running; finish or /cancel it first".into(),
            ));
        }
        let result = self.run(operator_id, &phone, cancel).await;
        self.end(operator_id);

        let entry = match &result {
            Ok(id) => ActivityEntry::ok(operator_id, "pair", format!("paired +{phone} as #{id}")),
            Err(e) => ActivityEntry::failed(operator_id, "pair", format!("pair +{phone}"), e.to_string()),
        };
        self.manager.log_activity(entry).await;
        result
    }

    async fn check_capacity(&self, phone: &str) -> Result<(), BridgeError> {
        let catalog = self.manager.catalog();
        if let Some(existing) = catalog.get_by_phone(phone).await? {
            let live = self
                .manager
                .client(existing.id)
                .await
                .is_some_and(|c| c.is_connected());
            if live {
                return Err(BridgeError::Validation(format!(
                    "+{phone} is already paired as account #{}",
                    existing.id
                )));
            }
        } else if catalog.count().await? >= self.manager.max_accounts() {
            return Err(BridgeError::Validation(format!(
                "account limit reached ({}); remove one first",
                self.manager.max_accounts()
            )));
        }
        Ok(())
    }

    async fn run(
        &self,
        operator_id: OperatorId,
        phone: &str,
        cancel: CancellationToken,
    ) -> Result<AccountId, BridgeError> {
        let staging = self.open_staging(operator_id).await?;

        let code = match self.request_code(&staging, phone, &cancel).await {
            Ok(code) => code,
            Err(e) => {
                staging.discard(false).await;
                return Err(e);
            }
        };

        let card = OutgoingMessage::text(operator_id, render_pairing_code(phone, &code))
            .with_keyboard(vec![vec![InlineButton::new("✖ Cancel", CANCEL_CALLBACK)]]);
        if let Err(e) = self.manager.notifier().send(card).await {
            warn!("pairing card delivery failed: {e}");
        }
        debug!("pairing code for +{phone}: {code}");
        info!("pairing code issued for operator {operator_id}");

        match self.wait_for_identity(&staging, &cancel).await {
            Ok(()) => self.finish(operator_id, phone, staging).await,
            Err(BridgeError::Cancelled) => {
                staging.discard(true).await;
                self.manager
                    .notifier()
                    .notify(operator_id, "Pairing cancelled.")
                    .await;
                Err(BridgeError::Cancelled)
            }
            Err(e) => {
                staging.discard(true).await;
                let text = format!(
                    "⌛ No confirmation for +{phone} within {}s. Nothing was saved.",
                    self.manager.timings().identity_timeout.as_secs()
                );
                let msg = OutgoingMessage::text(operator_id, text).with_keyboard(vec![vec![
                    InlineButton::new("🔁 Retry", retry_callback(phone)),
                ]]);
                if let Err(send_err) = self.manager.notifier().send(msg).await {
                    warn!("pairing timeout notice failed: {send_err}");
                }
                Err(e)
            }
        }
    }

    /// Fresh staging files and a client over them, events draining into an
    /// unassigned reactor.
    async fn open_staging(&self, operator_id: OperatorId) -> Result<Staging, BridgeError> {
        let paths = self.manager.paths();
        paths.ensure_user_folder(operator_id)?;
        let (upstream, bot) = paths.staging_paths(operator_id);
        remove_db_files(&upstream)?;
        remove_db_files(&bot)?;

        BotStore::open(&bot).await?.close().await;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = self.manager.factory().create(&upstream, events_tx).await?;
        let reactor = Reactor {
            client: Arc::downgrade(&client),
            route: EventRoute::unassigned(),
            intents: self.manager.intents(),
            bot_db_path: None,
            timings: self.manager.timings().clone(),
        }
        .spawn(events_rx);

        Ok(Staging {
            client,
            reactor,
            upstream,
            bot,
        })
    }

    async fn ensure_connected(&self, client: &dyn WaClient) -> Result<(), BridgeError> {
        if client.is_connected() {
            return Ok(());
        }
        client.disconnect().await;
        client
            .connect()
            .await
            .map_err(|e| BridgeError::Connect(e.to_string()))?;
        let timings = self.manager.timings();
        tokio::time::timeout(timings.pair_connect_timeout, wait_connected(client, timings))
            .await
            .map_err(|_| {
                BridgeError::Connect(format!(
                    "not connected after {}s",
                    timings.pair_connect_timeout.as_secs()
                ))
            })?
    }

    async fn request_code(
        &self,
        staging: &Staging,
        phone: &str,
        cancel: &CancellationToken,
    ) -> Result<String, BridgeError> {
        self.ensure_connected(staging.client.as_ref()).await?;

        let timings = self.manager.timings();
        tokio::select! {
            _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
            _ = tokio::time::sleep(timings.pair_settle) => {}
        }

        let request = staging.client.pair_phone(phone, true, CLIENT_NAME);
        match tokio::time::timeout(timings.pair_code_timeout, request).await {
            Ok(Ok(code)) => Ok(code),
            Ok(Err(e)) => Err(classify_pair_error(&e.to_string())),
            Err(_) => Err(BridgeError::Transient(
                "pairing code request timed out; try again".into(),
            )),
        }
    }

    async fn wait_for_identity(
        &self,
        staging: &Staging,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        let timings = self.manager.timings();
        let deadline = tokio::time::Instant::now() + timings.identity_timeout;
        loop {
            if staging.client.has_identity() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(BridgeError::PairTimeout(timings.identity_timeout.as_secs()));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
                _ = tokio::time::sleep(timings.identity_poll) => {}
            }
        }
    }

    /// Close the staging client, rename its files to the canonical names,
    /// register, make current, and reconnect.
    async fn finish(
        &self,
        operator_id: OperatorId,
        phone: &str,
        staging: Staging,
    ) -> Result<AccountId, BridgeError> {
        let paths = self.manager.paths();
        let upstream = paths.db_path(operator_id, phone, DbKind::Upstream);
        let bot = paths.db_path(operator_id, phone, DbKind::BotData);

        staging.reactor.abort();
        staging.client.disconnect().await;
        drop(staging.client);

        // A stale canonical pair for the same phone is replaced.
        remove_db_files(&upstream)?;
        remove_db_files(&bot)?;
        move_db_files(&staging.upstream, &upstream)?;
        if staging.bot.exists() {
            move_db_files(&staging.bot, &bot)?;
        }

        let catalog = self.manager.catalog();
        let id = catalog.add(phone, &upstream, &bot).await?;
        let account = catalog
            .get(id)
            .await?
            .ok_or_else(|| BridgeError::Db(format!("account {id} vanished after insert")))?;
        self.manager.adopt(account).await;
        self.manager.set_current(id).await?;
        info!("account {id} (+{phone}) paired for operator {operator_id}");

        let text = match self.manager.create_client(id).await {
            Ok(()) => format!("✅ +{phone} paired as account #{id} and selected."),
            Err(e) => {
                warn!("account {id}: reconnect after pairing failed: {e}");
                format!(
                    "✅ +{phone} paired as account #{id}, but reconnecting failed ({e}). \
                     It will be retried on the next sync."
                )
            }
        };
        self.manager.notifier().notify(operator_id, &text).await;
        Ok(id)
    }
}

/// Map a pairing-code failure onto the error the operator should see.
pub fn classify_pair_error(message: &str) -> BridgeError {
    match classify(message) {
        ErrorClass::ReadOnly => BridgeError::Fs(message.to_string()),
        ErrorClass::Timeout => BridgeError::Transient(message.to_string()),
        ErrorClass::NotConnected => BridgeError::Connect(message.to_string()),
        _ => BridgeError::Upstream(message.to_string()),
    }
}
