//! Wolfpack Error Types

use thiserror::Error;

/// Result type alias for wolfpack operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wolfpack error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Session errors
    #[error("Session creation failed for {node}: {reason}")]
    SessionCreation { node: String, reason: String },

    // Store errors
    #[error("Coordination store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Coordination store request timed out: {0}")]
    Timeout(String),

    #[error("Connection reset by coordination store: {0}")]
    ConnectionReset(String),

    #[error("Coordination store rejected request: {0}")]
    Store(String),

    #[error("Store transport error: {0}")]
    Http(#[from] reqwest::Error),

    // Data errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to decode stored payload for {key}: {reason}")]
    Deserialization { key: String, reason: String },

    #[error("No membership entry found for {0}")]
    NotFound(String),

    #[error("Ambiguous membership result for {node}: {count} entries")]
    AmbiguousResult { node: String, count: usize },

    // Retry errors
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is a transient fault worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::ConnectionReset(_) | Error::StoreUnavailable(_) => true,
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            Error::Store(msg) | Error::Internal(msg) => message_is_transient(msg),
            _ => false,
        }
    }
}

/// Fault-message classification used when the store surfaces faults as
/// opaque text rather than typed variants.
fn message_is_transient(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection reset")
        || lower.contains("unavailable")
}
