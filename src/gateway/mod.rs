//! Gateway: the main loop between Telegram and the account manager.
//!
//! One task pumps Telegram updates; each update is dispatched on its own
//! task. Background tasks run the intent loop, the status/group timers and
//! the post-startup connect of remaining accounts. Shutdown stops input,
//! cancels running jobs, then disconnects every session under a deadline.

mod bulk_ops;
mod routing;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wabridge_accounts::{AccountManager, Bootstrapper, BulkConfig, ReconcileReport};
use wabridge_channels::TelegramChannel;
use wabridge_core::{config::Config, traits::Notifier, OperatorId};

use crate::commands::BOT_COMMANDS;

/// Status sync cadence.
const SYNC_INTERVAL: Duration = Duration::from_secs(120);
/// Group cache refresh cadence.
const GROUPS_INTERVAL: Duration = Duration::from_secs(300);
/// Upper bound for the whole shutdown sequence.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);
/// Sent to every operator when startup leaves no account connected.
const LOGIN_PROMPT: &str =
    "📵 No WhatsApp account is connected.\nPair one with /pair <phone>, e.g. /pair +62 812 3456 7890";

/// What an operator's running job is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobKind {
    Pairing,
    Bulk,
}

pub(crate) struct Job {
    kind: JobKind,
    token: CancellationToken,
}

pub struct Gateway {
    pub(super) config: Config,
    pub(super) manager: Arc<AccountManager>,
    pub(super) pairing: Bootstrapper,
    pub(super) notifier: Arc<dyn Notifier>,
    /// Absent in tests; needed only for polling and callback answers.
    pub(super) telegram: Option<Arc<TelegramChannel>>,
    pub(super) bulk: BulkConfig,
    pub(super) shutdown: CancellationToken,
    /// One running pairing or bulk job per operator.
    pub(super) jobs: StdMutex<HashMap<OperatorId, Job>>,
    pub(super) started: Instant,
}

impl Gateway {
    pub fn new(
        config: Config,
        manager: Arc<AccountManager>,
        notifier: Arc<dyn Notifier>,
        telegram: Option<Arc<TelegramChannel>>,
    ) -> Self {
        let bulk = BulkConfig::from_settings(&config.settings);
        Self {
            config,
            pairing: Bootstrapper::new(manager.clone()),
            manager,
            notifier,
            telegram,
            bulk,
            shutdown: CancellationToken::new(),
            jobs: StdMutex::new(HashMap::new()),
            started: Instant::now(),
        }
    }

    /// Run until SIGINT/SIGTERM.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let telegram = self
            .telegram
            .clone()
            .ok_or_else(|| anyhow::anyhow!("gateway started without a Telegram channel"))?;

        telegram.register_commands(BOT_COMMANDS).await;

        self.start_sessions().await;

        let intents = self.manager.spawn_intent_loop(self.shutdown.clone());
        let background = self.spawn_background();
        let mut updates = telegram.start(self.shutdown.clone());

        info!(
            "wabridge gateway running | operators: {} | max accounts: {}",
            self.config.operators().len(),
            self.config.settings.max_accounts
        );

        loop {
            tokio::select! {
                incoming = updates.recv() => {
                    let Some(incoming) = incoming else {
                        warn!("telegram update stream closed");
                        break;
                    };
                    let gw = self.clone();
                    tokio::spawn(async move {
                        gw.dispatch(incoming).await;
                    });
                }
                _ = wait_for_signal() => {
                    info!("received shutdown signal");
                    break;
                }
            }
        }

        self.shutdown_all(intents, background).await;
        Ok(())
    }

    /// Reconcile and elect the current account. With nothing elected, every
    /// operator gets the pairing prompt.
    pub(super) async fn start_sessions(&self) -> ReconcileReport {
        let report = self.manager.startup().await;
        info!(
            "startup: {} migrated, {} registered, {} pruned, {} orphan(s) removed, {} error(s)",
            report.migrated.len(),
            report.registered.len(),
            report.pruned.len(),
            report.orphans_removed.len(),
            report.errors.len()
        );
        for e in &report.errors {
            warn!("startup: {e}");
        }
        if report.current.is_none() {
            for operator_id in self.config.operators() {
                self.notifier.notify(operator_id, LOGIN_PROMPT).await;
            }
        }
        report
    }

    /// Connect the rest of the catalog, then run the sync and group timers.
    fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let manager = self.manager.clone();
        let shutdown = self.shutdown.clone();
        handles.push(tokio::spawn(async move {
            tokio::select! {
                n = manager.connect_remaining() => {
                    if n > 0 {
                        info!("background connect: {n} more account(s) online");
                    }
                }
                _ = shutdown.cancelled() => {}
            }
        }));

        let manager = self.manager.clone();
        let shutdown = self.shutdown.clone();
        handles.push(tokio::spawn(async move {
            let mut sync = tokio::time::interval(SYNC_INTERVAL);
            let mut groups = tokio::time::interval(GROUPS_INTERVAL);
            sync.tick().await;
            groups.tick().await;
            loop {
                tokio::select! {
                    _ = sync.tick() => {
                        let n = manager.sync_all().await;
                        debug!("status sync: {n} account(s) active");
                    }
                    _ = groups.tick() => {
                        let n = manager.refresh_groups_all().await;
                        debug!("group refresh: {n} group(s) cached");
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        }));

        handles
    }

    async fn shutdown_all(
        &self,
        intents: Option<JoinHandle<()>>,
        background: Vec<JoinHandle<()>>,
    ) {
        info!("shutting down...");
        self.shutdown.cancel();
        for job in self.lock_jobs().values() {
            job.token.cancel();
        }
        for handle in background {
            handle.abort();
        }
        if let Some(handle) = intents {
            handle.abort();
        }

        match tokio::time::timeout(SHUTDOWN_DEADLINE, self.manager.shutdown()).await {
            Ok(()) => info!("shutdown complete"),
            Err(_) => error!(
                "shutdown did not finish within {}s; exiting anyway",
                SHUTDOWN_DEADLINE.as_secs()
            ),
        }
    }

    pub(super) fn lock_jobs(&self) -> std::sync::MutexGuard<'_, HashMap<OperatorId, Job>> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a job for `operator_id`. `None` when one is already running.
    pub(super) fn begin_job(&self, operator_id: OperatorId, kind: JobKind) -> Option<CancellationToken> {
        let mut jobs = self.lock_jobs();
        if jobs.contains_key(&operator_id) {
            return None;
        }
        let token = self.shutdown.child_token();
        jobs.insert(
            operator_id,
            Job {
                kind,
                token: token.clone(),
            },
        );
        Some(token)
    }

    pub(super) fn end_job(&self, operator_id: OperatorId) {
        self.lock_jobs().remove(&operator_id);
    }

    /// Cancel the operator's running job; returns what was cancelled.
    pub(super) fn cancel_job(&self, operator_id: OperatorId) -> Option<JobKind> {
        let jobs = self.lock_jobs();
        let job = jobs.get(&operator_id)?;
        job.token.cancel();
        Some(job.kind)
    }

    pub(super) async fn reply(&self, chat_id: i64, text: impl AsRef<str>) {
        self.notifier.notify(chat_id, text.as_ref()).await;
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("cannot install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
