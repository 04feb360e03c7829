//! Stage - an unordered bag of tasks at one pipeline position

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::states::State;

use super::pipeline::PostExecCtx;
use super::task::Task;
use super::{generate_uid, now_ms};

/// User callback fired once, after every task of the stage is terminal
///
/// Runs on the dequeuer under the pipeline's stage lock; mutations go through
/// the [`PostExecCtx`] builder API so the single-writer rule holds.
pub type PostExecFn = Arc<dyn Fn(&mut PostExecCtx<'_>) -> eyre::Result<()> + Send + Sync>;

/// One position in a pipeline, holding tasks that run in parallel
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Stage {
    pub uid: String,

    pub name: String,

    pub state: State,

    #[serde(rename = "state-history")]
    pub state_history: Vec<State>,

    pub tasks: Vec<Task>,

    #[serde(rename = "parent-pipeline")]
    pub parent_pipeline: Option<String>,

    #[serde(rename = "created-at")]
    pub created_at: i64,

    /// Not serialized: function values do not cross the wire
    #[serde(skip)]
    pub post_exec: Option<PostExecFn>,
}

impl Default for Stage {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("uid", &self.uid)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("tasks", &self.tasks.len())
            .field("parent_pipeline", &self.parent_pipeline)
            .field("post_exec", &self.post_exec.is_some())
            .finish()
    }
}

impl PartialEq for Stage {
    /// Equality over data fields; the callback is not comparable
    fn eq(&self, other: &Self) -> bool {
        self.uid == other.uid
            && self.name == other.name
            && self.state == other.state
            && self.state_history == other.state_history
            && self.tasks == other.tasks
            && self.parent_pipeline == other.parent_pipeline
            && self.created_at == other.created_at
    }
}

impl Stage {
    /// Create an empty stage with a fresh uid
    pub fn new() -> Self {
        Self {
            uid: generate_uid("stage"),
            name: String::new(),
            state: State::Initial,
            state_history: vec![State::Initial],
            tasks: Vec::new(),
            parent_pipeline: None,
            created_at: now_ms(),
            post_exec: None,
        }
    }

    /// Builder method to set the name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add one task
    pub fn add_task(&mut self, task: Task) {
        self.tasks.push(task);
    }

    /// Add several tasks
    pub fn add_tasks(&mut self, tasks: impl IntoIterator<Item = Task>) {
        self.tasks.extend(tasks);
    }

    /// Builder method to add several tasks
    pub fn with_tasks(mut self, tasks: impl IntoIterator<Item = Task>) -> Self {
        self.add_tasks(tasks);
        self
    }

    /// Install the post-exec callback
    pub fn set_post_exec<F>(&mut self, hook: F)
    where
        F: Fn(&mut PostExecCtx<'_>) -> eyre::Result<()> + Send + Sync + 'static,
    {
        self.post_exec = Some(Arc::new(hook));
    }

    /// Builder method to install the post-exec callback
    pub fn with_post_exec<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut PostExecCtx<'_>) -> eyre::Result<()> + Send + Sync + 'static,
    {
        self.set_post_exec(hook);
        self
    }

    /// Apply a state and record it in the history
    pub fn set_state(&mut self, state: State) {
        self.state = state;
        self.state_history.push(state);
    }

    /// Check whether every task has reached a terminal state
    ///
    /// An empty stage never counts as settled; validation rejects it anyway.
    pub fn tasks_terminal(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(Task::is_terminal)
    }

    /// Check whether any task ended in failure
    pub fn any_task_failed(&self) -> bool {
        self.tasks.iter().any(|t| t.state == State::Failed)
    }

    /// Find a task by uid
    pub fn task_mut(&mut self, uid: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.uid == uid)
    }

    /// Check the stage is runnable: at least one task, all of them valid
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.tasks.is_empty() {
            return Err(EngineError::missing(format!("stage {}", self.uid), "tasks"));
        }
        for task in &self.tasks {
            task.validate()?;
        }
        Ok(())
    }

    /// Serialize to a JSON value (the callback is dropped)
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("stage serialization is infallible")
    }

    /// Deserialize from a JSON value
    pub fn from_dict(value: &serde_json::Value) -> Result<Self, EngineError> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_task(arg: &str) -> Task {
        Task::new().with_executable("/bin/echo").with_arguments([arg])
    }

    #[test]
    fn test_new_stage_defaults() {
        let stage = Stage::new();
        assert!(stage.uid.starts_with("stage."));
        assert_eq!(stage.state, State::Initial);
        assert!(stage.tasks.is_empty());
        assert!(stage.post_exec.is_none());
    }

    #[test]
    fn test_empty_stage_rejected() {
        let stage = Stage::new();
        let err = stage.validate().unwrap_err();
        assert!(matches!(err, EngineError::Missing { .. }));
    }

    #[test]
    fn test_validate_checks_tasks() {
        let mut stage = Stage::new();
        stage.add_task(Task::new()); // no executable
        assert!(stage.validate().is_err());

        let stage = Stage::new().with_tasks([echo_task("a")]);
        assert!(stage.validate().is_ok());
    }

    #[test]
    fn test_tasks_terminal() {
        let mut stage = Stage::new().with_tasks([echo_task("a"), echo_task("b")]);
        assert!(!stage.tasks_terminal());

        stage.tasks[0].set_state(State::Done);
        assert!(!stage.tasks_terminal());

        stage.tasks[1].set_state(State::Failed);
        assert!(stage.tasks_terminal());
        assert!(stage.any_task_failed());
    }

    #[test]
    fn test_empty_stage_never_settled() {
        let stage = Stage::new();
        assert!(!stage.tasks_terminal());
    }

    #[test]
    fn test_dict_roundtrip_drops_callback() {
        let mut stage = Stage::new()
            .with_name("sim")
            .with_tasks([echo_task("x")])
            .with_post_exec(|_ctx| Ok(()));
        stage.set_state(State::Scheduling);

        let restored = Stage::from_dict(&stage.to_dict()).unwrap();
        assert_eq!(restored, stage); // data equality ignores the callback
        assert!(restored.post_exec.is_none());
    }

    #[test]
    fn test_clone_shares_callback() {
        let stage = Stage::new()
            .with_tasks([echo_task("x")])
            .with_post_exec(|_ctx| Ok(()));
        let copy = stage.clone();
        assert!(copy.post_exec.is_some());
    }
}
