use super::types::{RecordId, RequestType};
use chrono::NaiveDate;
use thiserror::Error;

/// Main error type for apptally operations
#[derive(Debug, Error)]
pub enum TallyError {
    #[error("Counter cache error: {0}")]
    Cache(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Aggregate store error: {0}")]
    Store(String),

    #[error("Aggregate record not found: {0}")]
    RecordNotFound(RecordId),

    #[error("Aggregate record for {request_type} on {date} still conflicts after retry")]
    RecordConflict {
        date: NaiveDate,
        request_type: RequestType,
    },

    #[error("{failed} counter operation(s) failed, first: {first}")]
    PartialFailure {
        failed: usize,
        first: Box<TallyError>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

impl TallyError {
    /// Whether the error came from the durable aggregate store
    pub fn is_store_fault(&self) -> bool {
        match self {
            Self::Store(_) | Self::RecordNotFound(_) | Self::RecordConflict { .. } => true,
            Self::PartialFailure { first, .. } => first.is_store_fault(),
            _ => false,
        }
    }
}

impl From<std::io::Error> for TallyError {
    fn from(e: std::io::Error) -> Self {
        TallyError::Snapshot(e.to_string())
    }
}

impl From<serde_json::Error> for TallyError {
    fn from(e: serde_json::Error) -> Self {
        TallyError::Snapshot(e.to_string())
    }
}

/// Result type alias for apptally operations
pub type Result<T> = std::result::Result<T, TallyError>;
