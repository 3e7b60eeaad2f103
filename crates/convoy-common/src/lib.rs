//! Convoy Common - Shared types and utilities
//!
//! This crate provides the foundational pieces used across all Convoy components:
//! - Error types and configuration validation
//! - Cancellable, deadline-bearing contexts
//! - Clock abstraction for deterministic tests
//! - Shutdown hook registration
//! - Retry backoff, UTC timestamps and random ids

pub mod backoff;
pub mod clock;
pub mod context;
pub mod error;
pub mod idgen;
pub mod shutdown;
pub mod utctime;

// Re-exports for convenience
pub use backoff::RetryBackoff;
pub use clock::{Clock, MockClock, SystemClock};
pub use context::{CancelHandle, Context};
pub use error::{ConvoyError, Validation};
pub use idgen::random_id;
pub use shutdown::{Process, ShutdownHook, ShutdownRegistrar};
pub use utctime::UtcTime;
