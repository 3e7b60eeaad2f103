// Metrics of the coordination components
// Recorded through the `metrics` facade, the binary decides where they go

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Register metric descriptions, call once at startup
pub fn init_metrics() {
    describe_gauge!("convoy_task_running", "Number of tasks currently running on the node");
    describe_counter!("convoy_task_started_total", "Total number of started tasks");
    describe_histogram!(
        "convoy_task_duration_seconds",
        "Task duration in seconds, labelled by outcome"
    );
    describe_gauge!(
        "convoy_distribution_nodes",
        "Number of nodes discovered in the distribution group"
    );

    tracing::info!("Metrics initialized");
}

/// Record a started task
pub fn record_task_started(task_type: &str) {
    counter!("convoy_task_started_total", "task_type" => task_type.to_string()).increment(1);
    gauge!("convoy_task_running", "task_type" => task_type.to_string()).increment(1.0);
}

/// Record a finished task; `error_kind` is empty for successful and expected failures
pub fn record_task_finished(task_type: &str, is_success: bool, error_kind: &str, duration: Duration) {
    gauge!("convoy_task_running", "task_type" => task_type.to_string()).decrement(1.0);
    histogram!(
        "convoy_task_duration_seconds",
        "task_type" => task_type.to_string(),
        "is_success" => is_success.to_string(),
        "error_kind" => error_kind.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Update the number of nodes in a distribution group
pub fn set_distribution_nodes(group: &str, count: usize) {
    gauge!("convoy_distribution_nodes", "group" => group.to_string()).set(count as f64);
}
