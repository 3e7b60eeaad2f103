use convoy_common::ConvoyError;

use crate::model::{LeaseId, Revision};

/// Store error types
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable")]
    Unavailable,

    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    #[error("store closed")]
    Closed,

    #[error("required revision {requested} has been compacted, compact revision is {compacted}")]
    Compacted {
        requested: Revision,
        compacted: Revision,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("cannot encode value of key \"{key}\": {message}")]
    Encode { key: String, message: String },

    #[error("cannot decode value of key \"{key}\": {message}")]
    Decode { key: String, message: String },

    #[error("key \"{0}\" already exists")]
    AlreadyExists(String),

    #[error("no active session")]
    NoSession,

    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable | StoreError::Timeout)
    }
}

impl From<ConvoyError> for StoreError {
    fn from(err: ConvoyError) -> Self {
        match err {
            ConvoyError::Cancelled => StoreError::Cancelled,
            ConvoyError::DeadlineExceeded => StoreError::Timeout,
            other => StoreError::Internal(other.to_string()),
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
