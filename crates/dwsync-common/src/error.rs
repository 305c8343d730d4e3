//! Error types shared across dwsync crates

use thiserror::Error;

/// Result type alias for dwsync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for dwsync
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Target error: {0}")]
    Target(String),

    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}
