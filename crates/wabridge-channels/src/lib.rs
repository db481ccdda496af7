//! # wabridge-channels
//!
//! Platform adapters: the Telegram Bot API front end and the upstream
//! WhatsApp client factory.

pub mod telegram;
mod unavailable;
#[cfg(feature = "whatsapp-web")]
pub mod whatsapp;

use std::sync::Arc;

use wabridge_core::traits::WaClientFactory;

pub use telegram::TelegramChannel;
pub use unavailable::UnavailableFactory;

/// The upstream client factory this build was compiled with.
pub fn client_factory() -> Arc<dyn WaClientFactory> {
    #[cfg(feature = "whatsapp-web")]
    {
        Arc::new(whatsapp::WebClientFactory::default())
    }
    #[cfg(not(feature = "whatsapp-web"))]
    {
        Arc::new(UnavailableFactory)
    }
}
