//! In-memory upstream client and notifier for tests.
//!
//! `MockClient` keeps its device store on disk (the `wa_*` schema), so the
//! reconciler and pairing see the same files a real client would write.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use wabridge_core::{
    classify::upstream_error,
    message::{GroupInfo, OperatorId, OutgoingMessage, ParticipantAction, WaEvent},
    paths::{DbKind, PathResolver},
    traits::{Notifier, WaClient, WaClientFactory},
    AccountId, BridgeError,
};
use wabridge_store::{device, BotStore, Catalog};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// How clients built by a [`MockFactory`] behave.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub connect_ok: bool,
    /// Pairing code returned by `pair_phone`, or the error text.
    pub pair_result: Result<String, String>,
    /// Assign an identity this long after a pairing code is issued.
    pub confirm_after: Option<Duration>,
    pub groups: Vec<GroupInfo>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            connect_ok: true,
            pair_result: Ok("ABCD1234".into()),
            confirm_after: Some(Duration::from_millis(20)),
            groups: Vec::new(),
        }
    }
}

pub struct MockClient {
    path: PathBuf,
    events: mpsc::UnboundedSender<WaEvent>,
    behavior: MockBehavior,
    connected: AtomicBool,
    identity: Arc<AtomicBool>,
    failures: Mutex<HashMap<String, VecDeque<String>>>,
    calls: Mutex<Vec<String>>,
}

impl MockClient {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue an error for the next call of `op` on `target`
    /// (e.g. `("set_group_name", "1@g.us")`).
    pub fn fail_next(&self, op: &str, target: &str, message: &str) {
        lock(&self.failures)
            .entry(format!("{op}:{target}"))
            .or_default()
            .push_back(message.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Push an event as if it came from upstream.
    pub fn emit(&self, event: WaEvent) {
        let _ = self.events.send(event);
    }

    /// Drop the connection the way the network would.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.emit(WaEvent::Disconnected);
    }

    fn record(&self, op: &str, target: &str) -> Result<(), BridgeError> {
        lock(&self.calls).push(format!("{op}:{target}"));
        let next = lock(&self.failures)
            .get_mut(&format!("{op}:{target}"))
            .and_then(|q| q.pop_front());
        match next {
            Some(message) => Err(upstream_error(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl WaClient for MockClient {
    async fn connect(&self) -> Result<(), BridgeError> {
        lock(&self.calls).push("connect".into());
        if !self.behavior.connect_ok {
            return Err(upstream_error("dial failed: connection refused"));
        }
        self.connected.store(true, Ordering::SeqCst);
        self.emit(WaEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(WaEvent::Disconnected);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn has_identity(&self) -> bool {
        self.identity.load(Ordering::SeqCst)
    }

    async fn logout(&self) -> Result<(), BridgeError> {
        self.record("logout", "")?;
        self.identity.store(false, Ordering::SeqCst);
        self.emit(WaEvent::LoggedOut);
        Ok(())
    }

    async fn pair_phone(
        &self,
        phone: &str,
        _show_push: bool,
        _client_name: &str,
    ) -> Result<String, BridgeError> {
        self.record("pair_phone", phone)?;
        let code = self
            .behavior
            .pair_result
            .clone()
            .map_err(BridgeError::Upstream)?;
        if let Some(delay) = self.behavior.confirm_after {
            let path = self.path.clone();
            let identity = self.identity.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Ok(pool) = device::init_device_store(&path).await {
                    let _ = device::write_identity_row(&pool, b"paired").await;
                    pool.close().await;
                }
                identity.store(true, Ordering::SeqCst);
                let _ = events.send(WaEvent::PairSuccess);
            });
        }
        Ok(code)
    }

    async fn group_info(&self, jid: &str) -> Result<GroupInfo, BridgeError> {
        self.record("group_info", jid)?;
        self.behavior
            .groups
            .iter()
            .find(|g| g.jid == jid)
            .cloned()
            .ok_or_else(|| upstream_error("item-not-found"))
    }

    async fn joined_groups(&self) -> Result<Vec<GroupInfo>, BridgeError> {
        self.record("joined_groups", "")?;
        Ok(self.behavior.groups.clone())
    }

    async fn send_text(&self, jid: &str, _text: &str) -> Result<String, BridgeError> {
        self.record("send_text", jid)?;
        Ok(format!("msg-{}", lock(&self.calls).len()))
    }

    async fn set_group_name(&self, jid: &str, _name: &str) -> Result<(), BridgeError> {
        self.record("set_group_name", jid)
    }

    async fn set_group_description(&self, jid: &str, _description: &str) -> Result<(), BridgeError> {
        self.record("set_group_description", jid)
    }

    async fn join_group_with_link(&self, code: &str) -> Result<String, BridgeError> {
        self.record("join_group_with_link", code)?;
        Ok(format!("{}@g.us", code.to_lowercase()))
    }

    async fn leave_group(&self, jid: &str) -> Result<(), BridgeError> {
        self.record("leave_group", jid)
    }

    async fn update_participants(
        &self,
        jid: &str,
        _participants: &[String],
        action: ParticipantAction,
    ) -> Result<(), BridgeError> {
        self.record(&format!("participants_{}", action.as_str()), jid)
    }

    async fn set_group_announce(&self, jid: &str, _announce: bool) -> Result<(), BridgeError> {
        self.record("set_group_announce", jid)
    }

    async fn set_group_locked(&self, jid: &str, _locked: bool) -> Result<(), BridgeError> {
        self.record("set_group_locked", jid)
    }

    async fn group_invite_link(&self, jid: &str, _reset: bool) -> Result<String, BridgeError> {
        self.record("group_invite_link", jid)?;
        Ok(format!("https://chat.whatsapp.com/{}", jid.replace("@g.us", "")))
    }
}

/// Builds [`MockClient`]s and remembers them by device-store path.
#[derive(Default)]
pub struct MockFactory {
    behavior: Mutex<MockBehavior>,
    clients: Mutex<Vec<Arc<MockClient>>>,
}

impl MockFactory {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            clients: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *lock(&self.behavior) = behavior;
    }

    /// Most recent client opened over `path`.
    pub fn client_for(&self, path: &Path) -> Option<Arc<MockClient>> {
        lock(&self.clients)
            .iter()
            .rev()
            .find(|c| c.path == path)
            .cloned()
    }

    pub fn created(&self) -> usize {
        lock(&self.clients).len()
    }
}

#[async_trait]
impl WaClientFactory for MockFactory {
    async fn create(
        &self,
        db_path: &Path,
        events: mpsc::UnboundedSender<WaEvent>,
    ) -> Result<Arc<dyn WaClient>, BridgeError> {
        let pool = device::init_device_store(db_path).await?;
        pool.close().await;
        let identity = device::validate_device_store(db_path).await.is_valid();

        let client = Arc::new(MockClient {
            path: db_path.to_path_buf(),
            events,
            behavior: lock(&self.behavior).clone(),
            connected: AtomicBool::new(false),
            identity: Arc::new(AtomicBool::new(identity)),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        });
        lock(&self.clients).push(client.clone());
        Ok(client)
    }
}

/// Records every message instead of sending it.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<OutgoingMessage>>,
    next_id: AtomicI64,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<OutgoingMessage> {
        lock(&self.sent).clone()
    }

    pub fn texts_to(&self, chat_id: OperatorId) -> Vec<String> {
        lock(&self.sent)
            .iter()
            .filter(|m| m.chat_id == chat_id)
            .map(|m| m.text.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: OutgoingMessage) -> Result<i64, BridgeError> {
        lock(&self.sent).push(message);
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn edit(&self, _message_id: i64, message: OutgoingMessage) -> Result<(), BridgeError> {
        lock(&self.sent).push(message);
        Ok(())
    }

    async fn delete(&self, _chat_id: i64, _message_id: i64) -> Result<(), BridgeError> {
        Ok(())
    }
}

/// Write a paired device store and an empty bot-data store at the canonical
/// paths for `(operator_id, phone)`.
pub async fn seed_paired_files(paths: &PathResolver, operator_id: OperatorId, phone: &str) {
    let upstream = paths.db_path(operator_id, phone, DbKind::Upstream);
    let pool = device::init_device_store(&upstream)
        .await
        .expect("device store");
    device::write_identity_row(&pool, b"seed")
        .await
        .expect("identity row");
    pool.close().await;
    BotStore::open(&paths.db_path(operator_id, phone, DbKind::BotData))
        .await
        .expect("bot store")
        .close()
        .await;
}

/// [`seed_paired_files`] plus a catalog row.
pub async fn seed_account(
    catalog: &Catalog,
    paths: &PathResolver,
    operator_id: OperatorId,
    phone: &str,
) -> AccountId {
    seed_paired_files(paths, operator_id, phone).await;
    catalog
        .add(
            phone,
            &paths.db_path(operator_id, phone, DbKind::Upstream),
            &paths.db_path(operator_id, phone, DbKind::BotData),
        )
        .await
        .expect("catalog add")
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
