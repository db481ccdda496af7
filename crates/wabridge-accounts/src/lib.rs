//! # wabridge-accounts
//!
//! The session core:
//! - `manager`: in-memory sessions, current-account election, removal
//! - `reconcile`: startup migration, scan, prune, and orphan cleanup
//! - `reactor`: per-client event tasks that turn upstream events into intents
//! - `pairing`: the pair-by-phone-number bootstrap
//! - `bulk`: bounded, rate-limit-aware batch executor
//! - `context`: the operator-scoped view handed to command handlers

pub mod bulk;
pub mod context;
pub mod manager;
pub mod pairing;
pub mod reactor;
pub mod reconcile;
pub mod session;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod tests;

pub use bulk::{BulkConfig, BulkExecutor, BulkProgress, BulkSummary, ProgressSink};
pub use context::OperatorContext;
pub use manager::{AccountManager, ManagerDeps};
pub use pairing::Bootstrapper;
pub use reactor::Intent;
pub use reconcile::{ReconcileReport, Reconciler};
pub use session::{Phase, SessionSummary, Timings};
