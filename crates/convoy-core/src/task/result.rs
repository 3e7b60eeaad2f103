use std::collections::BTreeMap;

use serde::Serialize;

use super::model::FailureKind;

/// Outcome of a task operation
#[derive(Debug)]
pub struct TaskResult {
    outcome: Result<String, (FailureKind, anyhow::Error)>,
    outputs: BTreeMap<String, serde_json::Value>,
}

impl TaskResult {
    pub fn ok(result: impl Into<String>) -> Self {
        Self {
            outcome: Ok(result.into()),
            outputs: BTreeMap::new(),
        }
    }

    /// Unexpected failure.
    pub fn err(error: anyhow::Error) -> Self {
        Self::failed(FailureKind::Unexpected, error)
    }

    /// Expected failure, e.g. invalid user input; excluded from the error metric label.
    pub fn user_err(error: anyhow::Error) -> Self {
        Self::failed(FailureKind::Expected, error)
    }

    pub(crate) fn panic(message: impl Into<String>) -> Self {
        Self::failed(FailureKind::Panic, anyhow::anyhow!("panic: {}", message.into()))
    }

    fn failed(kind: FailureKind, error: anyhow::Error) -> Self {
        Self {
            outcome: Err((kind, error)),
            outputs: BTreeMap::new(),
        }
    }

    /// Adds an output stored with the task record; values which cannot be
    /// serialized are stored as `null`.
    pub fn with_output(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        self.outputs.insert(key.into(), value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn result(&self) -> Option<&str> {
        self.outcome.as_ref().ok().map(String::as_str)
    }

    pub fn error(&self) -> Option<&anyhow::Error> {
        self.outcome.as_ref().err().map(|(_, e)| e)
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.outcome.as_ref().err().map(|(k, _)| *k)
    }

    pub fn outputs(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.outputs
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        Result<String, (FailureKind, anyhow::Error)>,
        BTreeMap<String, serde_json::Value>,
    ) {
        (self.outcome, self.outputs)
    }
}
