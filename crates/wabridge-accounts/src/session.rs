//! Session entries and the delays that drive their lifecycle.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use wabridge_core::{traits::WaClient, AccountId, OperatorId};
use wabridge_store::{Account, AccountStatus};

/// Connection phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Unconnected,
    Connecting,
    Connected,
    LoggedOut,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unconnected => "unconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::LoggedOut => "logged out",
        }
    }
}

/// Every wait in the session lifecycle. Tests shrink these to milliseconds.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Upper bound for `connect` + `is_connected`.
    pub connect_timeout: Duration,
    /// Poll interval while waiting for `is_connected`.
    pub connect_poll: Duration,
    /// Pause after the connection comes up.
    pub connect_settle: Duration,
    /// Delay between a terminal event and realtime cleanup.
    pub cleanup_settle: Duration,
    /// Pairing: upper bound for the initial connect.
    pub pair_connect_timeout: Duration,
    /// Pairing: channel settle before requesting a code.
    pub pair_settle: Duration,
    /// Pairing: deadline for code issuance.
    pub pair_code_timeout: Duration,
    /// Pairing: identity poll interval.
    pub identity_poll: Duration,
    /// Pairing: identity poll deadline.
    pub identity_timeout: Duration,
    /// Deadline for `group_info`.
    pub group_info_timeout: Duration,
    /// Deadline for `joined_groups`.
    pub groups_fetch_timeout: Duration,
    /// Minimum gap between two message-triggered group refreshes.
    pub groups_refresh_gap: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            connect_poll: Duration::from_millis(500),
            connect_settle: Duration::from_secs(1),
            cleanup_settle: Duration::from_secs(1),
            pair_connect_timeout: Duration::from_secs(10),
            pair_settle: Duration::from_secs(2),
            pair_code_timeout: Duration::from_secs(5),
            identity_poll: Duration::from_secs(10),
            identity_timeout: Duration::from_secs(120),
            group_info_timeout: Duration::from_secs(5),
            groups_fetch_timeout: Duration::from_secs(30),
            groups_refresh_gap: Duration::from_secs(60),
        }
    }
}

impl Timings {
    /// Millisecond-scale timings for tests.
    pub fn fast() -> Self {
        Self {
            connect_timeout: Duration::from_millis(300),
            connect_poll: Duration::from_millis(5),
            connect_settle: Duration::from_millis(1),
            cleanup_settle: Duration::from_millis(20),
            pair_connect_timeout: Duration::from_millis(200),
            pair_settle: Duration::from_millis(1),
            pair_code_timeout: Duration::from_millis(100),
            identity_poll: Duration::from_millis(10),
            identity_timeout: Duration::from_millis(200),
            group_info_timeout: Duration::from_millis(100),
            groups_fetch_timeout: Duration::from_millis(200),
            groups_refresh_gap: Duration::from_millis(0),
        }
    }
}

/// Which account a client's events belong to. Unset while the client is
/// still a pairing candidate.
#[derive(Debug, Clone, Default)]
pub struct EventRoute(Arc<RwLock<Option<AccountId>>>);

impl EventRoute {
    pub fn to(account_id: AccountId) -> Self {
        Self(Arc::new(RwLock::new(Some(account_id))))
    }

    pub fn unassigned() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<AccountId> {
        *self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn assign(&self, account_id: AccountId) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = Some(account_id);
    }
}

/// One account held in memory.
pub(crate) struct SessionEntry {
    pub account: Account,
    pub client: Option<Arc<dyn WaClient>>,
    pub phase: Phase,
    /// Set once the manager itself starts tearing the session down, so the
    /// resulting `Disconnected` event is not treated as a failure.
    pub closing: bool,
    pub reactor: Option<JoinHandle<()>>,
    /// Cancelled when the account is cleaned up; bulk runs derive from it.
    pub work: CancellationToken,
}

impl SessionEntry {
    pub fn lazy(account: Account) -> Self {
        Self {
            account,
            client: None,
            phase: Phase::Unconnected,
            closing: false,
            reactor: None,
            work: CancellationToken::new(),
        }
    }

    pub fn is_live(&self) -> bool {
        !self.closing
            && self
                .client
                .as_ref()
                .is_some_and(|c| c.is_connected() && c.has_identity())
    }

    pub fn summary(&self, current: bool) -> SessionSummary {
        SessionSummary {
            account_id: self.account.id,
            phone: self.account.phone.clone(),
            operator_id: self.account.operator_id(),
            status: self.account.status,
            phase: self.phase,
            connected: self.client.as_ref().is_some_and(|c| c.is_connected()),
            current,
        }
    }
}

/// Read-only snapshot of a session, for listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub account_id: AccountId,
    pub phone: String,
    pub operator_id: Option<OperatorId>,
    pub status: AccountStatus,
    pub phase: Phase,
    pub connected: bool,
    pub current: bool,
}
