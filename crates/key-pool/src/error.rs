//! Error types for key pool operations

/// Errors from key pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid pool configuration: {0}")]
    Configuration(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),
}

/// Result alias for key pool operations.
pub type Result<T> = std::result::Result<T, Error>;
