//! The operator-scoped view command handlers work through.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use wabridge_core::{traits::WaClient, AccountId, BridgeError, OperatorId};
use wabridge_store::Account;

use crate::manager::AccountManager;
use crate::session::SessionSummary;

/// The account a command resolves to, with its live client.
pub struct Target {
    pub account: Account,
    pub client: Arc<dyn WaClient>,
}

/// Manager plus the operator issuing the command.
#[derive(Clone)]
pub struct OperatorContext {
    pub manager: Arc<AccountManager>,
    pub operator_id: OperatorId,
}

impl OperatorContext {
    pub fn new(manager: Arc<AccountManager>, operator_id: OperatorId) -> Self {
        Self {
            manager,
            operator_id,
        }
    }

    /// Sessions owned by this operator.
    pub async fn accounts(&self) -> Vec<SessionSummary> {
        self.manager
            .sessions()
            .await
            .into_iter()
            .filter(|s| s.operator_id == Some(self.operator_id))
            .collect()
    }

    /// Whether `id` belongs to this operator.
    pub async fn owns(&self, id: AccountId) -> bool {
        self.manager.operator_of(id).await == Some(self.operator_id)
    }

    /// The account this operator means: the current account when they own
    /// it, otherwise their first connected account.
    pub async fn target(&self) -> Result<Target, BridgeError> {
        let mut candidates = Vec::new();
        if let Some(current) = self.manager.current().await {
            candidates.push(current);
        }
        candidates.extend(
            self.accounts()
                .await
                .into_iter()
                .filter(|s| s.connected)
                .map(|s| s.account_id),
        );

        for id in candidates {
            if !self.owns(id).await {
                continue;
            }
            let (Some(account), Some(client)) =
                (self.manager.account(id).await, self.manager.client(id).await)
            else {
                continue;
            };
            if client.is_connected() {
                return Ok(Target { account, client });
            }
        }
        Err(BridgeError::Connect(
            "no connected account; pair one with /pair <phone>".into(),
        ))
    }

    /// Make `id` current, after checking ownership.
    pub async fn switch(&self, id: AccountId) -> Result<(), BridgeError> {
        if !self.owns(id).await {
            return Err(BridgeError::Validation(format!(
                "account #{id} does not belong to you"
            )));
        }
        if self.manager.client(id).await.is_none() {
            self.manager.create_client(id).await?;
        }
        self.manager.set_current(id).await
    }

    /// Remove `id`, after checking ownership.
    pub async fn remove(&self, id: AccountId) -> Result<bool, BridgeError> {
        if !self.owns(id).await {
            return Err(BridgeError::Validation(format!(
                "account #{id} does not belong to you"
            )));
        }
        self.manager.remove(id).await
    }

    /// A token cancelled by `parent` or by cleanup of `id`.
    pub async fn work_token(&self, id: AccountId, parent: &CancellationToken) -> CancellationToken {
        let run = parent.child_token();
        if let Some(account_token) = self.manager.work_token(id).await {
            let linked = run.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = account_token.cancelled() => linked.cancel(),
                    _ = linked.cancelled() => {}
                }
            });
        }
        run
    }
}
