//! Error types of the coordination components

use convoy_common::ConvoyError;
use convoy_store::StoreError;

/// Membership and key distribution errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DistributionError {
    /// No node is registered, the key is currently unowned.
    #[error("no node is available")]
    NoNodes,

    #[error(transparent)]
    InvalidConfig(#[from] ConvoyError),

    #[error("the node \"{0}\" was not found in the discovered nodes")]
    SelfNotDiscovered(String),

    #[error("the node \"{0}\" is already registered by another process")]
    AlreadyRegistered(String),

    #[error("distribution node startup timed out after {0:?}")]
    StartupTimeout(std::time::Duration),

    #[error("distribution store error: {0}")]
    Store(#[from] StoreError),
}

/// Task node errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("task context must have a deadline")]
    MissingDeadline,

    #[error("cannot start task \"{key}\": {source}")]
    StartFailed { key: String, source: StoreError },

    #[error("cannot update task and release lock: {0}")]
    Finalize(StoreError),

    /// The lock vanished while the task was running, typically because the
    /// session lease expired. Another node may have run the same task.
    #[error("cannot release task lock \"{0}\", not found")]
    LockNotFound(String),

    #[error("task node is shutting down")]
    ShuttingDown,

    #[error("task execution was aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    InvalidConfig(#[from] ConvoyError),

    #[error("task store error: {0}")]
    Store(#[from] StoreError),
}

/// Orchestrator errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorError {
    #[error(transparent)]
    InvalidConfig(#[from] ConvoyError),

    #[error("cannot start orchestrator \"{name}\": {source}")]
    StartFailed { name: String, source: StoreError },
}
