//! Error handling for the SIFT server

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid argument supplied by a caller
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown device, component, or external id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Authentication against an external service failed.
    /// `user_action` tells a user-facing surface what to do about it.
    #[error("Authentication failed: {message}")]
    AuthFailed { message: String, user_action: String },

    /// Transient transport failure; kills the adapter and triggers a re-scan
    #[error("Transport error: {0}")]
    Transport(String),

    /// Vendor response did not validate
    #[error("Parse error: {0}")]
    Parse(String),

    /// The service context has been killed
    #[error("Context is dead")]
    ContextDead,

    /// The adapter does not recognize the intent variant
    #[error("Unsupported intent: {0}")]
    UnsupportedIntent(String),

    /// Store contention; callers may retry
    #[error("Store busy: {0}")]
    Busy(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for failures a caller may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy(_))
    }
}
