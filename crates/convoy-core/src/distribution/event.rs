// Distribution change events
// Emitted when a node of the group is discovered or disappears

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Type of distribution change
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeEventType {
    /// A node joined the group
    Added,
    /// A node left the group or its lease expired
    Removed,
}

impl Display for ChangeEventType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeEventType::Added => write!(f, "ADDED"),
            ChangeEventType::Removed => write!(f, "REMOVED"),
        }
    }
}

/// One membership change
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub change_type: ChangeEventType,
    pub node_id: String,
    /// Human readable description, also used as the log message
    pub message: String,
}

impl ChangeEvent {
    pub fn node_added(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            change_type: ChangeEventType::Added,
            message: format!("found a new node \"{}\"", node_id),
            node_id,
        }
    }

    pub fn node_removed(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            change_type: ChangeEventType::Removed,
            message: format!("the node \"{}\" gone", node_id),
            node_id,
        }
    }
}

impl Display for ChangeEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Ordered batch of changes delivered to listeners
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChangeEvents(Vec<ChangeEvent>);

impl ChangeEvents {
    pub fn new(events: Vec<ChangeEvent>) -> Self {
        Self(events)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChangeEvent> {
        self.0.iter()
    }

    pub fn push(&mut self, event: ChangeEvent) {
        self.0.push(event);
    }

    pub fn extend(&mut self, other: ChangeEvents) {
        self.0.extend(other.0);
    }

    pub fn into_vec(self) -> Vec<ChangeEvent> {
        self.0
    }
}

impl Display for ChangeEvents {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, event) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", event)?;
        }
        Ok(())
    }
}

impl From<Vec<ChangeEvent>> for ChangeEvents {
    fn from(events: Vec<ChangeEvent>) -> Self {
        Self(events)
    }
}

impl IntoIterator for ChangeEvents {
    type Item = ChangeEvent;
    type IntoIter = std::vec::IntoIter<ChangeEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
