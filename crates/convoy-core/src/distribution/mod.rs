//! Cluster membership and key distribution

pub mod assigner;
pub mod event;
pub mod listener;
pub mod node;

pub use assigner::{Assigner, Ring};
pub use event::{ChangeEvent, ChangeEventType, ChangeEvents};
pub use listener::{Listener, Listeners, LoggingListener};
pub use node::{DistributionConfig, DistributionNode, NodeState};
