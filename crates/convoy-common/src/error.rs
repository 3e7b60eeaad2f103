//! Error types shared by all Convoy crates
//!
//! This module defines:
//! - `ConvoyError`: errors not owned by a single component
//! - `Validation`: collector for configuration problems, reported all at once

use std::fmt::{Display, Formatter};

/// Common error types
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConvoyError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(ConfigProblems),

    #[error("context cancelled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ConvoyError {
    /// True for the two context termination errors.
    pub fn is_context_error(&self) -> bool {
        matches!(self, ConvoyError::Cancelled | ConvoyError::DeadlineExceeded)
    }
}

/// List of configuration problems found by a single validation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigProblems(pub Vec<String>);

impl Display for ConfigProblems {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.0.len() {
            0 => write!(f, "no problems"),
            1 => write!(f, "{}", self.0[0]),
            n => {
                write!(f, "{} problems:", n)?;
                for problem in &self.0 {
                    write!(f, "\n- {}", problem)?;
                }
                Ok(())
            }
        }
    }
}

/// Collects configuration problems, so all of them are reported at once.
///
/// ```
/// use convoy_common::Validation;
///
/// let mut v = Validation::new();
/// v.check(!"".is_empty(), "name must be configured");
/// assert!(v.finish().is_err());
/// ```
#[derive(Debug, Default)]
pub struct Validation {
    problems: Vec<String>,
}

impl Validation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `message` when `ok` is false.
    pub fn check(&mut self, ok: bool, message: impl Into<String>) -> &mut Self {
        if !ok {
            self.problems.push(message.into());
        }
        self
    }

    pub fn push(&mut self, message: impl Into<String>) -> &mut Self {
        self.problems.push(message.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    pub fn finish(self) -> Result<(), ConvoyError> {
        if self.problems.is_empty() {
            Ok(())
        } else {
            Err(ConvoyError::InvalidConfig(ConfigProblems(self.problems)))
        }
    }
}
