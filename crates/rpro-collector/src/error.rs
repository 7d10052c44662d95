//! Collector error types

use thiserror::Error;

use crate::ingest::ProcessResult;

/// Result type alias for collector operations
pub type CollectorResult<T> = std::result::Result<T, CollectorError>;

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Every configured endpoint failed during one cycle
    #[error("No IHM endpoint reachable: {0}")]
    AllEndpointsFailed(String),

    /// The store rejected every file of a cycle
    ///
    /// The per-file results are kept so a manual run can still report them.
    #[error("Record store unavailable: {message}")]
    StoreUnavailable {
        message: String,
        results: Vec<ProcessResult>,
    },

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl CollectorError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}
