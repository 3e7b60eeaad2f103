//! Store key layout of the coordination components

use convoy_store::Prefix;

/// `runtime/distribution/group/<group>/nodes/<nodeID>`
pub fn distribution_nodes(group: &str) -> Prefix {
    Prefix::new("runtime/distribution/group")
        .add(group)
        .add("nodes")
}

/// `runtime/lock/task/<lockName>`
pub fn task_locks() -> Prefix {
    Prefix::new("runtime/lock/task")
}

/// `task/<scope>/<taskID>`
pub fn tasks() -> Prefix {
    Prefix::new("task")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(
            distribution_nodes("my-group").key("node1"),
            "runtime/distribution/group/my-group/nodes/node1"
        );
        assert_eq!(task_locks().key("my-lock"), "runtime/lock/task/my-lock");
        assert_eq!(tasks().key("scope/task1"), "task/scope/task1");
    }
}
