//! Error types for the update subsystem.
//!
//! Only configuration and storage failures use [`UpdateError`]. Network,
//! download and install failures have their own enums next to the component
//! that produces them, and the coordinator folds every one of them into its
//! state instead of returning them.

/// Top-level error type for configuration and persisted state.
#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Persisted key-value state could not be read or written.
    #[error("storage error: {0}")]
    Storage(String),

    /// HTTP client construction error.
    #[error("http client error: {0}")]
    Client(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, UpdateError>;
