//! Error types shared across Lineage crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, LineageError>;

/// Main error type for shared helpers
#[derive(Error, Debug)]
pub enum LineageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
