//! Backend error types

use thiserror::Error;

use crate::dataset::DatasetError;
use crate::db::DbError;
use crate::queue::QueueError;
use crate::worker::WorkerError;

/// Result type alias for backend entry points
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Errors surfaced by the backend binary and embedders
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lineage error: {0}")]
    Common(#[from] lineage_common::LineageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Whether the error is an expected race rather than a fault
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            BackendError::Queue(QueueError::JobClaimed(_))
                | BackendError::Queue(QueueError::JobNotFound(_))
                | BackendError::Dataset(DatasetError::NotFound(_))
        )
    }
}
