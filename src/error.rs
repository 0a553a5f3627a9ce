// Error handling module
// Defines the error taxonomy of a benchmark run

use std::path::PathBuf;
use thiserror::Error;

use crate::backend::BackendError;

/// Errors that can end or degrade a benchmark run
#[derive(Error, Debug)]
pub enum BenchError {
    /// Feasibility violation detected before the backend is created
    #[error("Configuration error: {0}")]
    Config(String),

    /// Dataset could not be read or parsed
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Backend failure outside of a single request (startup, teardown)
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// JSON report could not be persisted
    #[error("Failed to write report to {}: {source}", path.display())]
    ReportWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Histogram construction failed
    #[error("Statistics error: {0}")]
    Histogram(#[from] hdrhistogram::CreationError),

    /// Generic I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BenchError {
    /// Shorthand for a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        BenchError::Config(message.into())
    }

    /// Whether this error was raised before any backend resource existed
    pub fn is_configuration(&self) -> bool {
        matches!(self, BenchError::Config(_))
    }
}

/// Result type alias for benchmark operations
pub type Result<T> = std::result::Result<T, BenchError>;
