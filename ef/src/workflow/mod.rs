//! Workflow model: pipelines of stages of tasks
//!
//! A workflow is an unordered set of independent pipelines. Each pipeline is
//! an ordered sequence of stages executed serially; each stage is an
//! unordered bag of tasks executed in parallel. Parent links are stored as
//! uids, never as owning references, so every entity serializes cleanly onto
//! the wire.

mod pipeline;
mod stage;
mod task;

pub use pipeline::{MAX_TASK_ATTEMPTS, Pipeline, PostExecCtx, SharedPipeline, TaskFailurePolicy, Workflow};
pub(crate) use pipeline::{ControlAction, PostExecEffects};
pub use stage::{PostExecFn, Stage};
pub use task::{CpuReqs, GpuReqs, Task};

use uuid::Uuid;

/// Generate a prefixed uid, e.g. `task.0190f6...`
pub(crate) fn generate_uid(prefix: &str) -> String {
    format!("{}.{}", prefix, Uuid::now_v7().simple())
}

/// Current wall-clock time in Unix milliseconds
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_uid_prefix_and_uniqueness() {
        let a = generate_uid("task");
        let b = generate_uid("task");
        assert!(a.starts_with("task."));
        assert_ne!(a, b);
    }
}
