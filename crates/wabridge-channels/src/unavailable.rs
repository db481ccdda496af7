use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use wabridge_core::{
    message::WaEvent,
    traits::{WaClient, WaClientFactory},
    BridgeError,
};

/// Factory used when the binary was built without an upstream client.
/// Every account then stays unconnected; catalog and reconciliation still work.
pub struct UnavailableFactory;

#[async_trait]
impl WaClientFactory for UnavailableFactory {
    async fn create(
        &self,
        db_path: &Path,
        _events: mpsc::UnboundedSender<WaEvent>,
    ) -> Result<Arc<dyn WaClient>, BridgeError> {
        Err(BridgeError::Connect(format!(
            "no WhatsApp client compiled in (rebuild with --features whatsapp-web); cannot open {}",
            db_path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unavailable_factory_refuses() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = UnavailableFactory
            .create(Path::new("x.db"), tx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BridgeError::Connect(_)));
        assert!(err.to_string().contains("whatsapp-web"));
    }
}
