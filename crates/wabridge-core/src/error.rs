use thiserror::Error;

/// Top-level error type for wabridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Missing or invalid configuration. Fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// Directory or database file could not be created, written, or renamed.
    #[error("filesystem error: {0}")]
    Fs(String),

    /// Schema or query failure.
    #[error("database error: {0}")]
    Db(String),

    /// Upstream `connect` failed or did not establish within the timeout.
    #[error("connect error: {0}")]
    Connect(String),

    /// The identity poll expired before the phone attached the device.
    #[error("pairing timed out after {0}s")]
    PairTimeout(u64),

    /// Upstream throttled the call.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Upstream reports the session is gone (logged out, device removed, ...).
    #[error("authentication failed: {0}")]
    AuthFatal(String),

    /// User-supplied input (phone, link, id) is malformed.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Deadline exceeded or similar; retrying may succeed.
    #[error("temporary failure: {0}")]
    Transient(String),

    /// Any other upstream failure, raw message preserved.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Telegram transport failure.
    #[error("channel error: {0}")]
    Channel(String),

    /// The operation was cancelled by the operator or by shutdown.
    #[error("cancelled")]
    Cancelled,

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BridgeError {
    /// Short title used by the user-facing error template.
    pub fn title(&self) -> &'static str {
        match self {
            Self::Config(_) => "Configuration problem",
            Self::Fs(_) | Self::Io(_) => "File system problem",
            Self::Db(_) => "Database problem",
            Self::Connect(_) => "Connection failed",
            Self::PairTimeout(_) => "Pairing timed out",
            Self::RateLimited(_) => "Rate limited",
            Self::AuthFatal(_) => "Account logged out",
            Self::Validation(_) => "Invalid input",
            Self::Transient(_) => "Temporary failure",
            Self::Upstream(_) => "WhatsApp error",
            Self::Channel(_) => "Telegram error",
            Self::Cancelled => "Cancelled",
            Self::Serialization(_) => "Data error",
        }
    }

    /// Suggested remedies shown under the error detail.
    pub fn remedies(&self) -> &'static [&'static str] {
        match self {
            Self::Connect(_) => &["Check the server's internet connection", "Press retry"],
            Self::PairTimeout(_) => &[
                "Open WhatsApp > Linked devices > Link with phone number",
                "Enter the code within two minutes",
                "Press retry for a new code",
            ],
            Self::RateLimited(_) => &["Wait a few minutes before the next batch"],
            Self::AuthFatal(_) => &["Pair the number again with /pair"],
            Self::Validation(_) => &["Check the format and try again", "See /help"],
            Self::Transient(_) => &["Try again in a moment"],
            Self::Fs(_) | Self::Io(_) => &["Check disk space and folder permissions"],
            Self::Db(_) => &["Try again", "Restart the bot if it keeps failing"],
            _ => &[],
        }
    }
}
