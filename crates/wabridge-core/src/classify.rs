//! Substring classification of upstream error messages.
//!
//! The upstream library reports some terminal states only as error text, so
//! every synchronous failure is run through [`classify`] before deciding
//! whether to retry, give up, or purge the account.

use crate::error::BridgeError;

/// What an upstream error message means for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The session is unrecoverable; trigger realtime cleanup.
    AuthFatal,
    /// Throttled; the bulk executor retries with backoff.
    RateLimited,
    /// A context deadline expired.
    Timeout,
    /// The client is not connected to the upstream service.
    NotConnected,
    /// The device store is read-only or lacks permissions.
    ReadOnly,
    /// Anything else.
    Other,
}

/// Markers of an unrecoverable session.
pub const AUTH_FATAL_MARKERS: &[&str] = &[
    "404",
    "401",
    "unauthorized",
    "device_removed",
    "not logged in",
    "session expired",
    "authentication failed",
    "logged out",
];

/// Markers of upstream throttling.
pub const RATE_LIMIT_MARKERS: &[&str] = &["429", "rate-overlimit", "rate limit"];

const TIMEOUT_MARKERS: &[&str] = &["deadline exceeded", "timed out", "timeout"];
const NOT_CONNECTED_MARKERS: &[&str] = &["not connected", "websocket not connected"];
const READ_ONLY_MARKERS: &[&str] = &["readonly", "read-only", "read only", "permission denied"];

/// Classify a raw error message. Matching is case-insensitive; auth-fatal
/// markers win over everything else.
pub fn classify(message: &str) -> ErrorClass {
    let lower = message.to_lowercase();
    let any = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if any(AUTH_FATAL_MARKERS) {
        ErrorClass::AuthFatal
    } else if any(RATE_LIMIT_MARKERS) {
        ErrorClass::RateLimited
    } else if any(READ_ONLY_MARKERS) {
        ErrorClass::ReadOnly
    } else if any(NOT_CONNECTED_MARKERS) {
        ErrorClass::NotConnected
    } else if any(TIMEOUT_MARKERS) {
        ErrorClass::Timeout
    } else {
        ErrorClass::Other
    }
}

/// Classify a [`BridgeError`], honouring variants that already carry a class.
///
/// Only text that came back from the upstream service is matched against
/// the markers. Local errors (validation, filesystem, database, Telegram)
/// embed user input and paths and are always [`ErrorClass::Other`].
pub fn classify_error(err: &BridgeError) -> ErrorClass {
    match err {
        BridgeError::AuthFatal(_) => ErrorClass::AuthFatal,
        BridgeError::RateLimited(_) => ErrorClass::RateLimited,
        BridgeError::Transient(_) => ErrorClass::Timeout,
        BridgeError::Upstream(message) | BridgeError::Connect(message) => classify(message),
        _ => ErrorClass::Other,
    }
}

/// Lift a raw upstream message into the matching [`BridgeError`] variant.
pub fn upstream_error(message: impl Into<String>) -> BridgeError {
    let message = message.into();
    match classify(&message) {
        ErrorClass::AuthFatal => BridgeError::AuthFatal(message),
        ErrorClass::RateLimited => BridgeError::RateLimited(message),
        ErrorClass::Timeout => BridgeError::Transient(message),
        ErrorClass::NotConnected => BridgeError::Connect(message),
        ErrorClass::ReadOnly => BridgeError::Fs(message),
        ErrorClass::Other => BridgeError::Upstream(message),
    }
}
