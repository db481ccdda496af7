//! # wabridge-core
//!
//! Core types, traits, configuration, path layout, and error handling shared
//! by every wabridge crate.

pub mod classify;
pub mod config;
pub mod error;
pub mod format;
pub mod message;
pub mod paths;
pub mod traits;

pub use error::BridgeError;
pub use message::{AccountId, OperatorId};
