//! Pools for the currently selected account.
//!
//! Each slot remembers the path it was opened with. When the path
//! resolver's current account moves, the next access opens a pool for the
//! new path and swaps it in under the registry mutex; the old pool is
//! closed by a short-lived task after `close_delay` so queries already
//! holding a clone can finish.

use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};
use wabridge_core::{paths::PathResolver, BridgeError};

use crate::bot_data::BotStore;
use crate::device;

/// Default quiescence delay before a replaced pool is closed.
pub const DEFAULT_CLOSE_DELAY: Duration = Duration::from_secs(2);

#[derive(Default)]
struct Slots {
    bot: Option<(PathBuf, BotStore)>,
    upstream: Option<(PathBuf, SqlitePool)>,
}

/// Owns the current bot-data pool and the current upstream pool.
pub struct PoolRegistry {
    paths: Arc<PathResolver>,
    slots: Mutex<Slots>,
    close_delay: Duration,
}

impl PoolRegistry {
    pub fn new(paths: Arc<PathResolver>) -> Self {
        Self::with_close_delay(paths, DEFAULT_CLOSE_DELAY)
    }

    pub fn with_close_delay(paths: Arc<PathResolver>, close_delay: Duration) -> Self {
        Self {
            paths,
            slots: Mutex::new(Slots::default()),
            close_delay,
        }
    }

    pub fn paths(&self) -> &Arc<PathResolver> {
        &self.paths
    }

    /// Bot-data store of the current account.
    /// The path is read under the registry mutex so it cannot go stale
    /// against [`Self::release`].
    pub async fn bot_store(&self) -> Result<BotStore, BridgeError> {
        let mut slots = self.slots.lock().await;
        let path = self
            .paths
            .current_bot_db_path()
            .ok_or_else(|| BridgeError::Db("no current account selected".into()))?;

        if let Some((cached, store)) = &slots.bot {
            if cached == &path {
                return Ok(store.clone());
            }
        }

        let store = BotStore::open(&path).await?;
        if let Some((old_path, old)) = slots.bot.replace((path.clone(), store.clone())) {
            debug!("bot pool swap: {} -> {}", old_path.display(), path.display());
            self.close_later(old.pool().clone());
        } else {
            info!("bot pool opened at {}", path.display());
        }
        Ok(store)
    }

    /// Raw pool over the current account's upstream device store. The
    /// store must already exist.
    pub async fn upstream_pool(&self) -> Result<SqlitePool, BridgeError> {
        let mut slots = self.slots.lock().await;
        let path = self
            .paths
            .current_upstream_db_path()
            .ok_or_else(|| BridgeError::Db("no current account selected".into()))?;

        if let Some((cached, pool)) = &slots.upstream {
            if cached == &path {
                return Ok(pool.clone());
            }
        }

        let pool = device::open_existing(&path).await?;
        if let Some((_, old)) = slots.upstream.replace((path, pool.clone())) {
            self.close_later(old);
        }
        Ok(pool)
    }

    /// Path the cached bot pool was opened with.
    pub async fn cached_bot_path(&self) -> Option<PathBuf> {
        self.slots.lock().await.bot.as_ref().map(|(p, _)| p.clone())
    }

    /// Drop any cached pool opened over `path` (used before its files are
    /// deleted or moved).
    pub async fn release(&self, path: &Path) {
        let mut slots = self.slots.lock().await;
        if slots.bot.as_ref().is_some_and(|(p, _)| p == path) {
            if let Some((_, store)) = slots.bot.take() {
                store.close().await;
            }
        }
        if slots.upstream.as_ref().is_some_and(|(p, _)| p == path) {
            if let Some((_, pool)) = slots.upstream.take() {
                pool.close().await;
            }
        }
    }

    /// Close both pools and forget their paths.
    pub async fn close_all(&self) {
        let mut slots = self.slots.lock().await;
        if let Some((path, store)) = slots.bot.take() {
            store.close().await;
            debug!("closed bot pool {}", path.display());
        }
        if let Some((path, pool)) = slots.upstream.take() {
            pool.close().await;
            debug!("closed upstream pool {}", path.display());
        }
    }

    fn close_later(&self, pool: SqlitePool) {
        let delay = self.close_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pool.close().await;
        });
    }
}
