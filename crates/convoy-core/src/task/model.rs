//! Task records persisted in the store

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use convoy_common::UtcTime;
use serde::{Deserialize, Serialize};

/// Identifies a task within a scope, rendered as `<scope>/<taskID>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskKey {
    pub scope: String,
    pub task_id: String,
}

impl TaskKey {
    pub fn new(scope: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            task_id: task_id.into(),
        }
    }
}

impl Display for TaskKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.scope, self.task_id)
    }
}

/// Classification of a task failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// User error, the task worked as designed
    Expected,
    Unexpected,
    Panic,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Expected => "expected",
            FailureKind::Unexpected => "unexpected",
            FailureKind::Panic => "panic",
        }
    }
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task state in the store, `task/<scope>/<taskID>`.
///
/// Created unfinished together with the lock, updated once when the task
/// finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    #[serde(flatten)]
    pub key: TaskKey,
    #[serde(rename = "type")]
    pub task_type: String,
    pub created_at: UtcTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<UtcTime>,
    pub node: String,
    /// Full key of the lock held while running.
    pub lock: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, serde_json::Value>,
    /// Duration in nanoseconds.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "duration_nanos")]
    pub duration: Option<Duration>,
}

impl TaskRecord {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn is_successful(&self) -> bool {
        self.is_finished() && self.error.is_none()
    }
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_nanos() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_nanos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unfinished_record_json() {
        let record = TaskRecord {
            key: TaskKey::new("123", "my-receiver/some.task/2010-01-01T01:00:00.000Z_abcde"),
            task_type: "some.task".to_string(),
            created_at: "2010-01-01T01:00:00Z".parse().unwrap(),
            finished_at: None,
            node: "node1".to_string(),
            lock: "runtime/lock/task/my-lock".to_string(),
            result: None,
            error: None,
            error_kind: None,
            outputs: BTreeMap::new(),
            duration: None,
        };
        assert_eq!(
            serde_json::to_value(&record).unwrap(),
            json!({
                "scope": "123",
                "taskId": "my-receiver/some.task/2010-01-01T01:00:00.000Z_abcde",
                "type": "some.task",
                "createdAt": "2010-01-01T01:00:00.000Z",
                "node": "node1",
                "lock": "runtime/lock/task/my-lock"
            })
        );
        assert!(!record.is_finished());
        assert_eq!(record.key.to_string(), "123/my-receiver/some.task/2010-01-01T01:00:00.000Z_abcde");
    }

    #[test]
    fn test_failed_record_json() {
        let value = json!({
            "scope": "123",
            "taskId": "t1",
            "type": "some.task",
            "createdAt": "2010-01-01T01:00:00.000Z",
            "finishedAt": "2010-01-01T01:00:02.000Z",
            "node": "node1",
            "lock": "runtime/lock/task/t1",
            "error": "some error",
            "errorKind": "unexpected",
            "outputs": {"key": "value"},
            "duration": 2_000_000_000u64
        });
        let record: TaskRecord = serde_json::from_value(value.clone()).unwrap();
        assert!(record.is_finished());
        assert!(!record.is_successful());
        assert_eq!(record.error_kind, Some(FailureKind::Unexpected));
        assert_eq!(record.duration, Some(Duration::from_secs(2)));
        assert_eq!(serde_json::to_value(&record).unwrap(), value);
    }
}
