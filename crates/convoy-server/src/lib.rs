//! Convoy Server - worker process wiring
//!
//! Runs several coordinated worker nodes over one in-process store: each
//! node joins the distribution group, runs a task node and an orchestrator
//! processing triggers owned by the node.

pub mod config;
pub mod startup;
pub mod worker;
