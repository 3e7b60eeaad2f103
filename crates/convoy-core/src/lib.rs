//! Convoy Core - Cluster coordination components
//!
//! This crate provides:
//! - Distribution: node membership over leases and consistent-hash key ownership
//! - Tasks: at-most-once execution guarded by store locks, with persisted results
//! - Orchestrator: prefix watches turned into tasks on the owning node

pub mod distribution;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod orchestrator;
pub mod task;

pub use distribution::{Assigner, ChangeEvent, ChangeEventType, ChangeEvents, DistributionConfig, DistributionNode};
pub use error::{DistributionError, OrchestratorError, TaskError};
pub use orchestrator::{OrchestratorConfig, OrchestratorDeps, OrchestratorHandle, WatchEntry};
pub use task::{Admission, TaskConfig, TaskKey, TaskNode, TaskNodeConfig, TaskRecord, TaskResult};
