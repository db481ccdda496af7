//! WhatsApp Web client over `whatsapp-rust`.
//!
//! One [`WebClient`] per device store. `connect` builds and runs a bot over
//! the store; `pair_phone` restarts it in pair-code mode and waits for the
//! code event. Connection state is tracked from lifecycle events, identity
//! from the store's paired device row.

mod events;
mod groups;
mod store;
#[cfg(test)]
mod tests;

pub use events::message_text;
pub use store::AccountStore;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use wabridge_core::{
    classify::upstream_error,
    message::{GroupInfo, ParticipantAction, WaEvent},
    traits::{WaClient, WaClientFactory},
    BridgeError,
};
use whatsapp_rust::bot::Bot;
use whatsapp_rust::client::Client;
use whatsapp_rust::pair_code::PairCodeOptions;
use whatsapp_rust_tokio_transport::TokioWebSocketTransportFactory;
use whatsapp_rust_ureq_http_client::UreqHttpClient;

use events::{lifecycle, to_wa_event, Lifecycle};

/// Longest wait for the pairing code event after the bot starts.
const PAIR_CODE_WAIT: Duration = Duration::from_secs(30);

/// Opens [`WebClient`]s.
#[derive(Default)]
pub struct WebClientFactory;

#[async_trait]
impl WaClientFactory for WebClientFactory {
    async fn create(
        &self,
        db_path: &Path,
        events: mpsc::UnboundedSender<WaEvent>,
    ) -> Result<Arc<dyn WaClient>, BridgeError> {
        let store = Arc::new(AccountStore::open(db_path).await?);
        Ok(Arc::new(WebClient {
            path: db_path.to_path_buf(),
            identity: store.identity_flag(),
            store,
            events,
            connected: Arc::new(AtomicBool::new(false)),
            running: Mutex::new(None),
        }))
    }
}

struct Running {
    client: Arc<Client>,
    handle: JoinHandle<()>,
}

pub struct WebClient {
    path: PathBuf,
    store: Arc<AccountStore>,
    events: mpsc::UnboundedSender<WaEvent>,
    connected: Arc<AtomicBool>,
    identity: Arc<AtomicBool>,
    running: Mutex<Option<Running>>,
}

type CodeSlot = Arc<std::sync::Mutex<Option<oneshot::Sender<String>>>>;

impl WebClient {
    /// Build and run a bot. With `pair`, the bot asks for a pairing code
    /// and hands it to `code_tx`.
    async fn start(&self, pair: Option<(String, CodeSlot)>) -> Result<(), BridgeError> {
        self.stop().await;

        let events = self.events.clone();
        let connected = self.connected.clone();
        let code_slot = pair.as_ref().map(|(_, slot)| slot.clone());
        let path = self.path.display().to_string();

        let mut builder = Bot::builder()
            .with_backend(self.store.clone())
            .with_transport_factory(TokioWebSocketTransportFactory::new())
            .with_http_client(UreqHttpClient::new())
            .on_event(move |event, _client| {
                let events = events.clone();
                let connected = connected.clone();
                let code_slot = code_slot.clone();
                let path = path.clone();
                async move {
                    match lifecycle(&event) {
                        Lifecycle::Connected => connected.store(true, Ordering::SeqCst),
                        Lifecycle::Disconnected | Lifecycle::LoggedOut => {
                            connected.store(false, Ordering::SeqCst)
                        }
                        Lifecycle::PairingCode(code) => {
                            debug!("{path}: pairing code event");
                            let tx = code_slot.and_then(|slot| {
                                slot.lock().unwrap_or_else(|e| e.into_inner()).take()
                            });
                            if let Some(tx) = tx {
                                let _ = tx.send(code);
                            }
                        }
                        Lifecycle::Paired | Lifecycle::Other => {}
                    }
                    if let Some(mapped) = to_wa_event(&event) {
                        let _ = events.send(mapped);
                    }
                }
            });
        if let Some((phone, _)) = pair {
            builder = builder.with_pair_code(PairCodeOptions {
                phone_number: phone,
                ..Default::default()
            });
        }

        let mut bot = builder
            .build()
            .await
            .map_err(|e| BridgeError::Connect(format!("whatsapp bot build failed: {e}")))?;
        let client = bot.client();
        let handle = bot
            .run()
            .await
            .map_err(|e| upstream_error(format!("whatsapp bot run failed: {e}")))?;
        *self.running.lock().await = Some(Running { client, handle });
        info!("whatsapp client started for {}", self.path.display());
        Ok(())
    }

    async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        running.client.disconnect().await;
        running.handle.abort();
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(WaEvent::Disconnected);
        }
    }

    async fn client(&self) -> Result<Arc<Client>, BridgeError> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.client.clone())
            .ok_or_else(|| BridgeError::Connect("websocket not connected".into()))
    }
}

#[async_trait]
impl WaClient for WebClient {
    async fn connect(&self) -> Result<(), BridgeError> {
        self.start(None).await
    }

    async fn disconnect(&self) {
        self.stop().await;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn has_identity(&self) -> bool {
        self.identity.load(Ordering::SeqCst)
    }

    async fn logout(&self) -> Result<(), BridgeError> {
        let client = self.client().await?;
        client.logout().await.map_err(|e| upstream_error(e.to_string()))?;
        self.identity.store(false, Ordering::SeqCst);
        self.stop().await;
        Ok(())
    }

    async fn pair_phone(
        &self,
        phone: &str,
        _show_push: bool,
        client_name: &str,
    ) -> Result<String, BridgeError> {
        let (tx, rx) = oneshot::channel();
        let slot: CodeSlot = Arc::new(std::sync::Mutex::new(Some(tx)));
        debug!("requesting pairing code as {client_name}");
        self.start(Some((phone.to_string(), slot))).await?;
        match tokio::time::timeout(PAIR_CODE_WAIT, rx).await {
            Ok(Ok(code)) => Ok(code),
            Ok(Err(_)) => Err(upstream_error("pairing code channel closed")),
            Err(_) => {
                warn!("no pairing code after {}s", PAIR_CODE_WAIT.as_secs());
                Err(BridgeError::Transient("pairing code deadline exceeded".into()))
            }
        }
    }

    async fn group_info(&self, jid: &str) -> Result<GroupInfo, BridgeError> {
        groups::info(&self.client().await?, jid).await
    }

    async fn joined_groups(&self) -> Result<Vec<GroupInfo>, BridgeError> {
        groups::joined(&self.client().await?).await
    }

    async fn send_text(&self, jid: &str, text: &str) -> Result<String, BridgeError> {
        let client = self.client().await?;
        let jid = groups::parse_jid(jid)?;
        let msg = waproto::whatsapp::Message {
            conversation: Some(text.to_string()),
            ..Default::default()
        };
        client
            .send_message(jid, msg)
            .await
            .map_err(|e| upstream_error(e.to_string()))
    }

    async fn set_group_name(&self, jid: &str, name: &str) -> Result<(), BridgeError> {
        groups::set_name(&self.client().await?, jid, name).await
    }

    async fn set_group_description(&self, jid: &str, description: &str) -> Result<(), BridgeError> {
        groups::set_description(&self.client().await?, jid, description).await
    }

    async fn join_group_with_link(&self, code: &str) -> Result<String, BridgeError> {
        groups::join(&self.client().await?, code).await
    }

    async fn leave_group(&self, jid: &str) -> Result<(), BridgeError> {
        groups::leave(&self.client().await?, jid).await
    }

    async fn update_participants(
        &self,
        jid: &str,
        participants: &[String],
        action: ParticipantAction,
    ) -> Result<(), BridgeError> {
        groups::participants(&self.client().await?, jid, participants, action).await
    }

    async fn set_group_announce(&self, jid: &str, announce: bool) -> Result<(), BridgeError> {
        groups::set_announce(&self.client().await?, jid, announce).await
    }

    async fn set_group_locked(&self, jid: &str, locked: bool) -> Result<(), BridgeError> {
        groups::set_locked(&self.client().await?, jid, locked).await
    }

    async fn group_invite_link(&self, jid: &str, reset: bool) -> Result<String, BridgeError> {
        groups::invite_link(&self.client().await?, jid, reset).await
    }
}

impl Drop for WebClient {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.try_lock() {
            if let Some(running) = running.take() {
                running.handle.abort();
            }
        }
    }
}
