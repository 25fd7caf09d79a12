use thiserror::Error;

/// Error type for control registry operations.
#[derive(Debug, Error)]
pub enum AdminError {
    /// Controls must be registered under a non-empty key.
    #[error("control key must not be empty")]
    EmptyKey,
    /// Another live control already owns the key.
    #[error("control already registered: {0}")]
    DuplicateKey(String),
}

/// Result type alias for administrative operations.
pub type Result<T> = std::result::Result<T, AdminError>;
