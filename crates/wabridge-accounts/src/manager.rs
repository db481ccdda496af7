//! The session core.
//!
//! All in-memory state (sessions keyed by account id, the current account)
//! sits behind one mutex. Upstream `connect`/`disconnect` calls are made on
//! handles snapshotted out of the map, never while the lock is held.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wabridge_core::{
    paths::{remove_db_files, PathResolver},
    traits::{Notifier, WaClient, WaClientFactory},
    AccountId, BridgeError, OperatorId,
};
use wabridge_store::{
    validate_device_store, Account, AccountStatus, ActivityEntry, BotStore, Catalog,
    DeviceValidation, PoolRegistry,
};

use crate::reactor::{cache_joined_groups, Intent, Reactor};
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::session::{EventRoute, Phase, SessionEntry, SessionSummary, Timings};

/// Everything the manager is built from.
pub struct ManagerDeps {
    pub catalog: Catalog,
    pub paths: Arc<PathResolver>,
    pub factory: Arc<dyn WaClientFactory>,
    pub notifier: Arc<dyn Notifier>,
    pub timings: Timings,
    pub max_accounts: usize,
}

#[derive(Default)]
struct State {
    sessions: BTreeMap<AccountId, SessionEntry>,
    current: Option<AccountId>,
}

impl State {
    /// First live session in ascending id order, skipping `exclude`.
    fn elect(&self, exclude: Option<AccountId>) -> Option<AccountId> {
        self.sessions
            .iter()
            .find(|(id, entry)| Some(**id) != exclude && entry.is_live())
            .map(|(id, _)| *id)
    }
}

/// Owns every session and elects the current account.
pub struct AccountManager {
    catalog: Catalog,
    paths: Arc<PathResolver>,
    pools: PoolRegistry,
    factory: Arc<dyn WaClientFactory>,
    notifier: Arc<dyn Notifier>,
    timings: Timings,
    max_accounts: usize,
    state: Mutex<State>,
    intents_tx: mpsc::UnboundedSender<Intent>,
    intents_rx: StdMutex<Option<mpsc::UnboundedReceiver<Intent>>>,
}

impl AccountManager {
    pub fn new(deps: ManagerDeps) -> Arc<Self> {
        let (intents_tx, intents_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            pools: PoolRegistry::new(deps.paths.clone()),
            catalog: deps.catalog,
            paths: deps.paths,
            factory: deps.factory,
            notifier: deps.notifier,
            timings: deps.timings,
            max_accounts: deps.max_accounts,
            state: Mutex::new(State::default()),
            intents_tx,
            intents_rx: StdMutex::new(Some(intents_rx)),
        })
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn paths(&self) -> &Arc<PathResolver> {
        &self.paths
    }

    pub fn pools(&self) -> &PoolRegistry {
        &self.pools
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn factory(&self) -> &Arc<dyn WaClientFactory> {
        &self.factory
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    pub fn max_accounts(&self) -> usize {
        self.max_accounts
    }

    /// Sender half of the intent channel, for code that classifies upstream
    /// errors outside a reactor (bulk runs, pairing).
    pub fn intents(&self) -> mpsc::UnboundedSender<Intent> {
        self.intents_tx.clone()
    }

    /// Take the intent receiver. Only the first call gets it.
    pub fn take_intents(&self) -> Option<mpsc::UnboundedReceiver<Intent>> {
        self.intents_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    // --- Queries ---

    pub async fn current(&self) -> Option<AccountId> {
        self.state.lock().await.current
    }

    pub async fn client(&self, id: AccountId) -> Option<Arc<dyn WaClient>> {
        let state = self.state.lock().await;
        state.sessions.get(&id).and_then(|e| e.client.clone())
    }

    pub async fn account(&self, id: AccountId) -> Option<Account> {
        let state = self.state.lock().await;
        state.sessions.get(&id).map(|e| e.account.clone())
    }

    pub async fn sessions(&self) -> Vec<SessionSummary> {
        let state = self.state.lock().await;
        state
            .sessions
            .values()
            .map(|e| e.summary(state.current == Some(e.account.id)))
            .collect()
    }

    /// A token cancelled when the account is cleaned up.
    pub async fn work_token(&self, id: AccountId) -> Option<CancellationToken> {
        let state = self.state.lock().await;
        state.sessions.get(&id).map(|e| e.work.child_token())
    }

    /// Owner of `id`, from its canonical path.
    pub async fn operator_of(&self, id: AccountId) -> Option<OperatorId> {
        self.account(id).await.and_then(|a| a.operator_id())
    }

    // --- Lifecycle ---

    /// Create a lazy, unconnected session for every catalog row not yet in
    /// memory. Returns how many were added.
    pub async fn load_all(&self) -> Result<usize, BridgeError> {
        let accounts = self.catalog.list().await?;
        let mut state = self.state.lock().await;
        let mut added = 0;
        for account in accounts {
            if let std::collections::btree_map::Entry::Vacant(slot) =
                state.sessions.entry(account.id)
            {
                slot.insert(SessionEntry::lazy(account));
                added += 1;
            }
        }
        info!("loaded {added} account(s) from the catalog");
        Ok(added)
    }

    /// Add a freshly registered account to the session map.
    pub(crate) async fn adopt(&self, account: Account) {
        let mut state = self.state.lock().await;
        let id = account.id;
        match state.sessions.get_mut(&id) {
            Some(entry) => entry.account = account,
            None => {
                state.sessions.insert(id, SessionEntry::lazy(account));
            }
        }
    }

    /// Open the device store, start the reactor, connect, and wait for the
    /// connection to come up.
    pub async fn create_client(&self, id: AccountId) -> Result<(), BridgeError> {
        let (account, stale_client, stale_reactor) = {
            let mut state = self.state.lock().await;
            let entry = state
                .sessions
                .get_mut(&id)
                .ok_or_else(|| BridgeError::Validation(format!("unknown account {id}")))?;
            if entry.closing {
                return Err(BridgeError::Cancelled);
            }
            if entry.client.as_ref().is_some_and(|c| c.is_connected()) {
                return Ok(());
            }
            entry.phase = Phase::Connecting;
            (entry.account.clone(), entry.client.take(), entry.reactor.take())
        };

        if let Some(reactor) = stale_reactor {
            reactor.abort();
        }
        if let Some(client) = stale_client {
            client.disconnect().await;
        }

        match self.connect_new(&account).await {
            Ok((client, reactor)) => self.install(&account, client, reactor).await,
            Err(e) => {
                self.mark_unconnected(id).await;
                Err(e)
            }
        }
    }

    async fn connect_new(
        &self,
        account: &Account,
    ) -> Result<(Arc<dyn WaClient>, JoinHandle<()>), BridgeError> {
        let bot_path = PathBuf::from(&account.bot_db_path);
        match BotStore::open(&bot_path).await {
            Ok(store) => store.close().await,
            Err(e) => warn!("account {}: bot-data store unavailable: {e}", account.id),
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = self
            .factory
            .create(Path::new(&account.upstream_db_path), events_tx)
            .await
            .map_err(|e| BridgeError::Connect(format!("cannot open device store: {e}")))?;

        let reactor = Reactor {
            client: Arc::downgrade(&client),
            route: EventRoute::to(account.id),
            intents: self.intents_tx.clone(),
            bot_db_path: Some(bot_path),
            timings: self.timings.clone(),
        }
        .spawn(events_rx);

        let connected = async {
            client.connect().await?;
            wait_connected(client.as_ref(), &self.timings).await
        };
        match tokio::time::timeout(self.timings.connect_timeout, connected).await {
            Ok(Ok(())) => {
                tokio::time::sleep(self.timings.connect_settle).await;
                Ok((client, reactor))
            }
            Ok(Err(e)) => {
                reactor.abort();
                client.disconnect().await;
                Err(BridgeError::Connect(e.to_string()))
            }
            Err(_) => {
                reactor.abort();
                client.disconnect().await;
                Err(BridgeError::Connect(format!(
                    "connection did not come up within {}s",
                    self.timings.connect_timeout.as_secs()
                )))
            }
        }
    }

    async fn install(
        &self,
        account: &Account,
        client: Arc<dyn WaClient>,
        reactor: JoinHandle<()>,
    ) -> Result<(), BridgeError> {
        let id = account.id;
        {
            let mut state = self.state.lock().await;
            match state.sessions.get_mut(&id) {
                Some(entry) if !entry.closing => {
                    entry.client = Some(client);
                    entry.reactor = Some(reactor);
                    entry.phase = Phase::Connected;
                    entry.account.status = AccountStatus::Active;
                    if let Err(e) = self.catalog.update_status(id, AccountStatus::Active).await {
                        warn!("account {id}: status update failed: {e}");
                    }
                    info!("account {id} (+{}) connected", entry.account.phone);
                    return Ok(());
                }
                _ => {}
            }
        }
        // Removed while connecting.
        reactor.abort();
        client.disconnect().await;
        drop(client);
        if let Ok(None) = self.catalog.get(id).await {
            // The removal may have deleted the files before this connect
            // opened them again.
            for path in [&account.upstream_db_path, &account.bot_db_path] {
                if let Err(e) = remove_db_files(Path::new(path)) {
                    warn!("account {id}: leftover cleanup failed: {e}");
                }
            }
        }
        Err(BridgeError::Cancelled)
    }

    async fn mark_unconnected(&self, id: AccountId) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.sessions.get_mut(&id) {
            entry.phase = Phase::Unconnected;
            entry.account.status = AccountStatus::Inactive;
        }
        if let Err(e) = self.catalog.update_status(id, AccountStatus::Inactive).await {
            warn!("account {id}: status update failed: {e}");
        }
    }

    /// Make `id` current and point the path resolver at it.
    pub async fn set_current(&self, id: AccountId) -> Result<(), BridgeError> {
        let mut state = self.state.lock().await;
        let entry = state
            .sessions
            .get(&id)
            .filter(|e| !e.closing)
            .ok_or_else(|| BridgeError::Validation(format!("unknown account {id}")))?;
        let operator_id = entry.account.operator_id().ok_or_else(|| {
            BridgeError::Validation(format!("account {id} has a non-canonical path"))
        })?;
        self.paths.set_current(operator_id, &entry.account.phone);
        state.current = Some(id);
        debug!("current account is now {id}");
        Ok(())
    }

    fn apply_current(&self, state: &mut State, next: Option<AccountId>) {
        state.current = next;
        let target = next
            .and_then(|id| state.sessions.get(&id))
            .and_then(|e| e.account.operator_id().map(|op| (op, e.account.phone.clone())));
        match target {
            Some((operator_id, phone)) => self.paths.set_current(operator_id, &phone),
            None => {
                state.current = None;
                self.paths.clear_current();
            }
        }
    }

    /// Whether the account's device store still holds an identity.
    pub async fn validate(&self, id: AccountId) -> Result<DeviceValidation, BridgeError> {
        let path = match self.account(id).await {
            Some(account) => account.upstream_db_path,
            None => {
                self.catalog
                    .get(id)
                    .await?
                    .ok_or_else(|| BridgeError::Validation(format!("unknown account {id}")))?
                    .upstream_db_path
            }
        };
        Ok(validate_device_store(Path::new(&path)).await)
    }

    /// Persist the status implied by the live connection.
    pub async fn sync_status(&self, id: AccountId) -> Result<AccountStatus, BridgeError> {
        let mut state = self.state.lock().await;
        let entry = state
            .sessions
            .get_mut(&id)
            .ok_or_else(|| BridgeError::Validation(format!("unknown account {id}")))?;
        let connected = entry.client.as_ref().is_some_and(|c| c.is_connected());
        let status = if connected {
            AccountStatus::Active
        } else {
            AccountStatus::Inactive
        };
        entry.account.status = status;
        if connected {
            entry.phase = Phase::Connected;
        } else if entry.phase == Phase::Connected {
            entry.phase = Phase::Unconnected;
        }
        if self.catalog.update_status(id, status).await? {
            debug!("account {id}: status synced to {}", status.as_str());
        }
        Ok(status)
    }

    /// [`Self::sync_status`] for every session. Returns how many accounts
    /// are active afterwards; failures are logged.
    pub async fn sync_all(&self) -> usize {
        let ids: Vec<AccountId> = self.state.lock().await.sessions.keys().copied().collect();
        let mut active = 0;
        for id in ids {
            match self.sync_status(id).await {
                Ok(AccountStatus::Active) => active += 1,
                Ok(_) => {}
                Err(e) => warn!("account {id}: status sync failed: {e}"),
            }
        }
        active
    }

    /// Disconnect, delete the catalog row, and delete both databases with
    /// their sidecars. Safe to repeat: missing rows and files are tolerated.
    /// Returns whether the account was known.
    pub async fn remove(&self, id: AccountId) -> Result<bool, BridgeError> {
        let (client, reactor, known) = {
            let mut state = self.state.lock().await;
            let taken = match state.sessions.get_mut(&id) {
                Some(entry) => {
                    entry.closing = true;
                    entry.work.cancel();
                    (
                        entry.client.take(),
                        entry.reactor.take(),
                        Some(entry.account.clone()),
                    )
                }
                None => (None, None, None),
            };
            // Move the path resolver off the account before its files go.
            if state.current == Some(id) {
                let next = state.elect(Some(id));
                self.apply_current(&mut state, next);
            }
            taken
        };

        let account = match known {
            Some(account) => account,
            None => match self.catalog.get(id).await? {
                Some(account) => account,
                None => return Ok(false),
            },
        };

        if let Some(reactor) = reactor {
            reactor.abort();
        }
        if let Some(client) = client {
            client.disconnect().await;
        }

        self.catalog.remove(id).await?;

        let upstream = PathBuf::from(&account.upstream_db_path);
        let bot = PathBuf::from(&account.bot_db_path);
        self.pools.release(&upstream).await;
        self.pools.release(&bot).await;
        let removed = remove_db_files(&upstream)? + remove_db_files(&bot)?;

        {
            let mut state = self.state.lock().await;
            state.sessions.remove(&id);
            if state.current == Some(id) {
                let next = state.elect(Some(id));
                self.apply_current(&mut state, next);
            }
        }

        info!(
            "account {id} (+{}) removed, {removed} file(s) deleted",
            account.phone
        );
        if let Some(operator_id) = account.operator_id() {
            self.log_activity(ActivityEntry::ok(
                operator_id,
                "remove_account",
                format!("removed +{}", account.phone),
            ))
            .await;
        }
        Ok(true)
    }

    // --- Intents ---

    /// Consume intents until `shutdown` fires.
    pub fn spawn_intent_loop(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let mut rx = self.take_intents()?;
        let manager = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    intent = rx.recv() => match intent {
                        Some(intent) => manager.handle_intent(intent).await,
                        None => break,
                    },
                }
            }
            debug!("intent loop stopped");
        }))
    }

    pub async fn handle_intent(self: &Arc<Self>, intent: Intent) {
        match intent {
            Intent::Connected(id) => self.on_connected(id).await,
            Intent::Disconnected {
                account_id,
                logged_out,
            } => self.on_disconnected(account_id, logged_out, None).await,
            Intent::AuthFatal { account_id, reason } => {
                self.on_disconnected(account_id, true, Some(reason)).await
            }
        }
    }

    async fn on_connected(&self, id: AccountId) {
        let mut state = self.state.lock().await;
        let Some(entry) = state.sessions.get_mut(&id) else {
            return;
        };
        if entry.closing {
            return;
        }
        entry.phase = Phase::Connected;
        entry.account.status = AccountStatus::Active;
        if let Err(e) = self.catalog.update_status(id, AccountStatus::Active).await {
            warn!("account {id}: status update failed: {e}");
        }
        if state.current.is_none() && state.sessions.get(&id).is_some_and(|e| e.is_live()) {
            self.apply_current(&mut state, Some(id));
            info!("account {id} elected current after connecting");
        }
    }

    /// Mark the account down, move `current` off it, and schedule realtime
    /// cleanup. A plain disconnect that recovers before the settle delay
    /// elapses keeps the account.
    async fn on_disconnected(self: &Arc<Self>, id: AccountId, terminal: bool, reason: Option<String>) {
        let (account, switched) = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.sessions.get_mut(&id) else {
                debug!("disconnect for unknown account {id} ignored");
                return;
            };
            if entry.closing || (entry.phase == Phase::Connecting && reason.is_none()) {
                return;
            }
            if terminal {
                entry.work.cancel();
            }
            entry.phase = if terminal {
                Phase::LoggedOut
            } else {
                Phase::Unconnected
            };
            entry.account.status = AccountStatus::Inactive;
            let account = entry.account.clone();
            if let Err(e) = self
                .catalog
                .update_status(id, AccountStatus::Inactive)
                .await
            {
                warn!("account {id}: status update failed: {e}");
            }

            let switched = if state.current == Some(id) {
                let next = state.elect(Some(id));
                self.apply_current(&mut state, next);
                Some(next.and_then(|n| state.sessions.get(&n).map(|e| e.account.clone())))
            } else {
                None
            };
            (account, switched)
        };

        warn!(
            "account {id} (+{}) {}",
            account.phone,
            match &reason {
                Some(r) => format!("hit an auth-fatal error: {r}"),
                None if terminal => "logged out".to_string(),
                None => "disconnected".to_string(),
            }
        );

        if let Some(operator_id) = account.operator_id() {
            let mut text = format!("⚠️ Account +{} disconnected.", account.phone);
            match switched {
                Some(Some(next)) => text.push_str(&format!(
                    "\n🔀 Switched to account #{} (+{}).",
                    next.id, next.phone
                )),
                Some(None) => {
                    text.push_str("\nNo connected account left. Pair one with /pair <phone>.")
                }
                None => {}
            }
            self.notifier.notify(operator_id, &text).await;
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(manager.timings.cleanup_settle).await;
            manager.realtime_cleanup(id, terminal, reason).await;
        });
    }

    async fn realtime_cleanup(&self, id: AccountId, terminal: bool, reason: Option<String>) {
        if !terminal {
            let recovered = self
                .client(id)
                .await
                .is_some_and(|c| c.is_connected() && c.has_identity());
            if recovered {
                info!("account {id} reconnected; cleanup skipped");
                return;
            }
        }
        let account = self.account(id).await;
        match self.remove(id).await {
            Ok(true) => {
                if let Some(account) = account {
                    if let Some(operator_id) = account.operator_id() {
                        let why = reason.unwrap_or_else(|| "session ended".to_string());
                        self.notifier
                            .notify(
                                operator_id,
                                &format!(
                                    "🗑 Account +{} was removed ({why}). Pair it again with /pair {}.",
                                    account.phone, account.phone
                                ),
                            )
                            .await;
                    }
                }
            }
            Ok(false) => debug!("account {id} already gone"),
            Err(e) => error!("realtime cleanup of account {id} failed: {e}"),
        }
    }

    // --- Startup, background work, shutdown ---

    /// Reconcile disk and catalog, load sessions, and elect the current
    /// account by connecting candidates in ascending id order.
    pub async fn startup(&self) -> ReconcileReport {
        let mut report = Reconciler::new(&self.catalog, &self.paths).run().await;
        if let Err(e) = self.load_all().await {
            report.errors.push(format!("load sessions: {e}"));
        }

        let ids: Vec<AccountId> = self.state.lock().await.sessions.keys().copied().collect();
        for id in ids {
            match self.create_client(id).await {
                Ok(()) => match self.set_current(id).await {
                    Ok(()) => {
                        report.current = Some(id);
                        break;
                    }
                    Err(e) => report.errors.push(format!("account {id}: {e}")),
                },
                Err(e) => {
                    warn!("account {id}: startup connect failed: {e}");
                    report.errors.push(format!("account {id}: {e}"));
                }
            }
        }
        match report.current {
            Some(id) => info!("startup: current account is {id}"),
            None => info!("startup: no account connected; waiting for /pair"),
        }
        report
    }

    /// Connect every session that has no live client. Failures are logged.
    pub async fn connect_remaining(&self) -> usize {
        let pending: Vec<AccountId> = {
            let state = self.state.lock().await;
            state
                .sessions
                .iter()
                .filter(|(_, e)| !e.closing && e.client.is_none() && e.phase != Phase::Connecting)
                .map(|(id, _)| *id)
                .collect()
        };
        let mut connected = 0;
        for id in pending {
            match self.create_client(id).await {
                Ok(()) => connected += 1,
                Err(e) => warn!("account {id}: background connect failed: {e}"),
            }
        }
        connected
    }

    /// Refresh the group cache of every connected account.
    pub async fn refresh_groups_all(&self) -> usize {
        let targets: Vec<(AccountId, Arc<dyn WaClient>, PathBuf)> = {
            let state = self.state.lock().await;
            state
                .sessions
                .values()
                .filter(|e| !e.closing)
                .filter_map(|e| {
                    e.client
                        .clone()
                        .map(|c| (e.account.id, c, PathBuf::from(&e.account.bot_db_path)))
                })
                .collect()
        };

        let mut total = 0;
        for (id, client, bot_path) in targets {
            let store = match BotStore::open_existing(&bot_path).await {
                Ok(store) => store,
                Err(e) => {
                    warn!("account {id}: group cache unavailable: {e}");
                    continue;
                }
            };
            match cache_joined_groups(client.as_ref(), &store, &self.timings).await {
                Ok(n) => total += n,
                Err(e) => {
                    if !crate::reactor::escalate(&self.intents_tx, id, &e) {
                        debug!("account {id}: group refresh failed: {e}");
                    }
                }
            }
            store.close().await;
        }
        total
    }

    /// Append to the current account's activity log, or the master log when
    /// no account is current. Never fails.
    pub async fn log_activity(&self, entry: ActivityEntry) {
        let result = match self.pools.bot_store().await {
            Ok(store) => store.log_activity(&entry).await,
            Err(_) => self.catalog.log_activity(&entry).await,
        };
        if let Err(e) = result {
            warn!("activity log failed: {e}");
        }
    }

    /// Disconnect every client and close every pool. Returns once all
    /// disconnects have completed.
    pub async fn shutdown(&self) {
        let handles: Vec<(AccountId, Option<Arc<dyn WaClient>>, Option<JoinHandle<()>>)> = {
            let mut state = self.state.lock().await;
            state
                .sessions
                .iter_mut()
                .map(|(id, entry)| {
                    entry.closing = true;
                    entry.work.cancel();
                    (*id, entry.client.take(), entry.reactor.take())
                })
                .collect()
        };

        for (id, client, reactor) in handles {
            if let Some(reactor) = reactor {
                reactor.abort();
            }
            if let Some(client) = client {
                client.disconnect().await;
                debug!("account {id} disconnected");
            }
        }

        self.pools.close_all().await;
        self.catalog.close().await;
        info!("sessions closed");
    }
}

/// Poll `is_connected` until it holds. The caller bounds the wait.
pub(crate) async fn wait_connected(
    client: &dyn WaClient,
    timings: &Timings,
) -> Result<(), BridgeError> {
    while !client.is_connected() {
        tokio::time::sleep(timings.connect_poll).await;
    }
    Ok(())
}
