//! At-most-once task execution across the cluster

mod cleanup;
mod config;
mod model;
mod node;
mod result;

pub use cleanup::{CLEANUP_TASK_TYPE, should_delete};
pub use config::{CleanupConfig, ContextFactory, TaskConfig, TaskFn, TaskNodeConfig, task_fn};
pub use model::{FailureKind, TaskKey, TaskRecord};
pub use node::{Admission, StartedTask, TaskNode};
pub use result::TaskResult;
