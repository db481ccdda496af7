//! Generic bulk-operation executor.
//!
//! Items are split into batches. Within a batch a semaphore admits at most
//! `max_concurrency` workers; each attempt runs under `per_item_timeout`.
//! Rate-limited attempts are retried with a linear backoff until
//! `retry_attempts` attempts have been made; any other error fails the item
//! at once. Batches are separated by `inter_batch_delay`, the primary
//! throttle.
//!
//! Cancellation is cooperative: attempts already running finish, no retry
//! or new item starts afterwards, and the summary reports what was done.
//! An auth-fatal error cancels the whole run and is handed to the
//! `on_auth_fatal` hook.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wabridge_core::{
    classify::{classify_error, ErrorClass},
    config::Settings,
    BridgeError,
};

/// Tuning for one bulk run.
#[derive(Debug, Clone)]
pub struct BulkConfig {
    pub max_concurrency: usize,
    pub batch_size: usize,
    pub per_item_timeout: Duration,
    pub inter_batch_delay: Duration,
    /// Total attempts per item, the first one included.
    pub retry_attempts: u32,
    /// Backoff before retry `n` (0-based) is `(n + 1) * backoff_base`.
    pub backoff_base: Duration,
    /// Progress is reported at least this often.
    pub progress_interval: Duration,
    /// ...and every this many finished items.
    pub progress_every: usize,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            batch_size: 10,
            per_item_timeout: Duration::from_secs(8),
            inter_batch_delay: Duration::from_secs(1),
            retry_attempts: 3,
            backoff_base: Duration::from_secs(2),
            progress_interval: Duration::from_secs(2),
            progress_every: 5,
        }
    }
}

impl BulkConfig {
    /// Defaults with timeout and attempts taken from the config file.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            per_item_timeout: settings.timeout(),
            retry_attempts: settings.retry_attempts.max(1),
            ..Self::default()
        }
    }

    /// One item at a time, in input order.
    pub fn sequential(mut self) -> Self {
        self.max_concurrency = 1;
        self
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * (attempt + 1)
    }
}

/// A progress tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BulkProgress {
    pub current: usize,
    pub total: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Receives progress ticks. Implementations must not block for long.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn progress(&self, progress: BulkProgress);
}

/// A sink that drops every tick.
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn progress(&self, _progress: BulkProgress) {}
}

/// Final result of a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkSummary {
    pub total: usize,
    pub processed: usize,
    pub updated: usize,
    pub failed: usize,
    /// Whether the run stopped before every item was attempted.
    pub cancelled: bool,
    /// Set when an auth-fatal error stopped the run.
    pub auth_fatal: Option<String>,
    /// `(input index, reason)` for every failed item.
    pub failures: Vec<(usize, String)>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl BulkSummary {
    pub fn skipped(&self) -> usize {
        self.total - self.processed
    }
}

enum Outcome {
    Updated,
    Failed(String),
    AuthFatal(String),
    /// Never started because the run was cancelled.
    Skipped,
}

type FatalHook = Arc<dyn Fn(String) + Send + Sync>;

/// Drives one operation over many items.
pub struct BulkExecutor {
    config: BulkConfig,
    sink: Arc<dyn ProgressSink>,
    on_auth_fatal: Option<FatalHook>,
}

impl BulkExecutor {
    pub fn new(config: BulkConfig, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            config,
            sink,
            on_auth_fatal: None,
        }
    }

    /// Called once, with the error text, when an item fails auth-fatally.
    pub fn on_auth_fatal(mut self, hook: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_auth_fatal = Some(Arc::new(hook));
        self
    }

    pub fn config(&self) -> &BulkConfig {
        &self.config
    }

    /// Run `op` over `items`. `op` gets a clone of the item per attempt and
    /// a token cancelled with the run.
    pub async fn run<I, F, Fut>(
        &self,
        items: Vec<I>,
        op: F,
        cancel: CancellationToken,
    ) -> BulkSummary
    where
        I: Clone + Send + 'static,
        F: Fn(I, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BridgeError>> + Send + 'static,
    {
        let started = Instant::now();
        let total = items.len();
        let op = Arc::new(op);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let batch_size = self.config.batch_size.max(1);
        let mut summary = BulkSummary {
            total,
            ..Default::default()
        };
        let mut last_tick = Instant::now();
        let mut ticker = tokio::time::interval(
            self.config
                .progress_interval
                .max(Duration::from_millis(10)),
        );
        ticker.tick().await;

        let mut batches = items.into_iter().enumerate().peekable();
        let mut batch_no = 0usize;
        while batches.peek().is_some() {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            batch_no += 1;
            let batch: Vec<(usize, I)> = batches.by_ref().take(batch_size).collect();
            debug!("bulk batch {batch_no}: {} item(s)", batch.len());

            let mut workers = JoinSet::new();
            for (index, item) in batch {
                let semaphore = semaphore.clone();
                let op = op.clone();
                let cancel = cancel.clone();
                let config = self.config.clone();
                workers.spawn(async move {
                    let outcome = match semaphore.acquire_owned().await {
                        Ok(_permit) if !cancel.is_cancelled() => {
                            attempt_item(&config, op.as_ref(), item, &cancel).await
                        }
                        _ => Outcome::Skipped,
                    };
                    (index, outcome)
                });
            }

            loop {
                tokio::select! {
                    joined = workers.join_next() => {
                        let Some(joined) = joined else { break };
                        let (index, outcome) = match joined {
                            Ok(done) => done,
                            Err(e) => {
                                warn!("bulk worker panicked: {e}");
                                continue;
                            }
                        };
                        if self.record(&mut summary, index, outcome, &cancel) {
                            let every = self.config.progress_every.max(1);
                            if summary.processed % every == 0 {
                                self.tick(&summary).await;
                                last_tick = Instant::now();
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        if last_tick.elapsed() >= self.config.progress_interval {
                            self.tick(&summary).await;
                            last_tick = Instant::now();
                        }
                    }
                }
            }

            let more = batches.peek().is_some();
            if more && !cancel.is_cancelled() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.config.inter_batch_delay) => {}
                }
            }
        }

        if summary.processed < total {
            summary.cancelled = true;
        }
        summary.failures.sort_by_key(|(i, _)| *i);
        summary.elapsed = started.elapsed();
        self.tick(&summary).await;
        info!(
            "bulk run done: {}/{} processed, {} updated, {} failed in {:?}",
            summary.processed, total, summary.updated, summary.failed, summary.elapsed
        );
        summary
    }

    /// Returns whether the item counted as processed.
    fn record(
        &self,
        summary: &mut BulkSummary,
        index: usize,
        outcome: Outcome,
        cancel: &CancellationToken,
    ) -> bool {
        match outcome {
            Outcome::Updated => summary.updated += 1,
            Outcome::Failed(reason) => {
                summary.failed += 1;
                summary.failures.push((index, reason));
            }
            Outcome::AuthFatal(reason) => {
                summary.failed += 1;
                summary.failures.push((index, reason.clone()));
                if summary.auth_fatal.is_none() {
                    summary.auth_fatal = Some(reason.clone());
                    cancel.cancel();
                    if let Some(hook) = &self.on_auth_fatal {
                        hook(reason);
                    }
                }
            }
            Outcome::Skipped => return false,
        }
        summary.processed += 1;
        true
    }

    async fn tick(&self, summary: &BulkSummary) {
        self.sink
            .progress(BulkProgress {
                current: summary.processed,
                total: summary.total,
                updated: summary.updated,
                failed: summary.failed,
            })
            .await;
    }
}

async fn attempt_item<I, F, Fut>(
    config: &BulkConfig,
    op: &F,
    item: I,
    cancel: &CancellationToken,
) -> Outcome
where
    I: Clone,
    F: Fn(I, CancellationToken) -> Fut,
    Fut: Future<Output = Result<(), BridgeError>>,
{
    let attempts = config.retry_attempts.max(1);
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(
            config.per_item_timeout,
            op(item.clone(), cancel.child_token()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Transient(format!(
                "timed out after {}s",
                config.per_item_timeout.as_secs()
            ))),
        };

        let err = match result {
            Ok(()) => return Outcome::Updated,
            Err(err) => err,
        };
        match classify_error(&err) {
            ErrorClass::AuthFatal => {
                // Stop queued workers before this permit is released.
                cancel.cancel();
                return Outcome::AuthFatal(err.to_string());
            }
            ErrorClass::RateLimited if attempt + 1 < attempts && !cancel.is_cancelled() => {
                let wait = config.backoff(attempt);
                debug!("rate limited; retry {} in {wait:?}", attempt + 1);
                tokio::select! {
                    _ = cancel.cancelled() => return Outcome::Failed(err.to_string()),
                    _ = tokio::time::sleep(wait) => {}
                }
                attempt += 1;
            }
            _ => return Outcome::Failed(err.to_string()),
        }
    }
}
