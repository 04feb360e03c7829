//! Pipeline - ordered stages, plus the runtime lock/flag wrapper
//!
//! [`Pipeline`] is the plain, serializable record. [`SharedPipeline`] wraps
//! it for runtime use: the per-pipeline stage lock, the suspension flag read
//! by the enqueuer, and the completion signal the supervisor waits on. Each
//! side of the control plane (application manager, workflow processor) holds
//! its own replica; only the synchronizer writes the authoritative one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard, Notify};

use crate::error::EngineError;
use crate::states::State;

use super::stage::Stage;
use super::{generate_uid, now_ms};

/// What a failed task does to its parent stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskFailurePolicy {
    /// Fail the stage (and with it the pipeline) on the first failed task
    #[default]
    FailStage,
    /// Record the failure; the stage still settles when all tasks are terminal
    Continue,
    /// Re-queue the failed task until its attempt limit, then fail the stage
    Resubmit,
}

/// Resubmission ceiling for [`TaskFailurePolicy::Resubmit`]
pub const MAX_TASK_ATTEMPTS: u32 = 3;

/// An ordered sequence of stages executed serially
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pipeline {
    pub uid: String,

    pub name: String,

    pub state: State,

    #[serde(rename = "state-history")]
    pub state_history: Vec<State>,

    /// Stage order is fixed at construction; post-exec callbacks may append
    pub stages: Vec<Stage>,

    /// Index of the active stage; monotonically non-decreasing
    #[serde(rename = "current-stage")]
    pub current_stage: usize,

    pub completed: bool,

    #[serde(rename = "on-task-failure")]
    pub on_task_failure: TaskFailurePolicy,

    #[serde(rename = "created-at")]
    pub created_at: i64,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl Pipeline {
    /// Create an empty pipeline with a fresh uid
    pub fn new() -> Self {
        Self {
            uid: generate_uid("pipeline"),
            name: String::new(),
            state: State::Initial,
            state_history: vec![State::Initial],
            stages: Vec::new(),
            current_stage: 0,
            completed: false,
            on_task_failure: TaskFailurePolicy::default(),
            created_at: now_ms(),
        }
    }

    /// Builder method to set the name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Builder method to set the task-failure policy
    pub fn with_task_failure_policy(mut self, policy: TaskFailurePolicy) -> Self {
        self.on_task_failure = policy;
        self
    }

    /// Append a stage, stamping parent uids onto it and its tasks
    pub fn add_stage(&mut self, mut stage: Stage) {
        stage.parent_pipeline = Some(self.uid.clone());
        for task in &mut stage.tasks {
            task.parent_stage = Some(stage.uid.clone());
            task.parent_pipeline = Some(self.uid.clone());
        }
        self.stages.push(stage);
    }

    /// Append several stages
    pub fn add_stages(&mut self, stages: impl IntoIterator<Item = Stage>) {
        for stage in stages {
            self.add_stage(stage);
        }
    }

    /// Builder method to append several stages
    pub fn with_stages(mut self, stages: impl IntoIterator<Item = Stage>) -> Self {
        self.add_stages(stages);
        self
    }

    /// Apply a state and record it in the history
    pub fn set_state(&mut self, state: State) {
        self.state = state;
        self.state_history.push(state);
    }

    /// Re-stamp parent uids across the whole tree
    ///
    /// Covers tasks added to a stage after the stage joined the pipeline.
    pub fn assign_parents(&mut self) {
        let pipeline_uid = self.uid.clone();
        for stage in &mut self.stages {
            stage.parent_pipeline = Some(pipeline_uid.clone());
            for task in &mut stage.tasks {
                task.parent_stage = Some(stage.uid.clone());
                task.parent_pipeline = Some(pipeline_uid.clone());
            }
        }
    }

    /// The stage at the active index, if any remain
    pub fn active_stage(&self) -> Option<&Stage> {
        self.stages.get(self.current_stage)
    }

    /// Find a stage by uid
    pub fn stage_mut(&mut self, uid: &str) -> Option<&mut Stage> {
        self.stages.iter_mut().find(|s| s.uid == uid)
    }

    /// Position of a stage by uid
    pub fn stage_index(&self, uid: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.uid == uid)
    }

    /// Check the pipeline is runnable: at least one stage, all of them valid
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.stages.is_empty() {
            return Err(EngineError::missing(format!("pipeline {}", self.uid), "stages"));
        }
        for stage in &self.stages {
            stage.validate()?;
        }
        Ok(())
    }

    /// Serialize to a JSON value
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("pipeline serialization is infallible")
    }

    /// Deserialize from a JSON value
    pub fn from_dict(value: &serde_json::Value) -> Result<Self, EngineError> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Runtime wrapper around one pipeline replica
///
/// The inner mutex is the `stage_lock`: every traversal or mutation of the
/// stages, active index or state happens under it. The suspension flag and
/// completion signal live outside the lock so they can be checked cheaply.
pub struct SharedPipeline {
    uid: String,
    name: String,
    suspended: AtomicBool,
    completed: AtomicBool,
    completion: Notify,
    body: Mutex<Pipeline>,
}

impl SharedPipeline {
    /// Wrap a pipeline record for runtime use
    pub fn new(mut pipeline: Pipeline) -> Arc<Self> {
        pipeline.assign_parents();
        Arc::new(Self {
            uid: pipeline.uid.clone(),
            name: pipeline.name.clone(),
            suspended: AtomicBool::new(pipeline.state == State::Suspended),
            completed: AtomicBool::new(pipeline.completed),
            completion: Notify::new(),
            body: Mutex::new(pipeline),
        })
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire the stage lock
    pub async fn lock(&self) -> MutexGuard<'_, Pipeline> {
        self.body.lock().await
    }

    /// Raise the suspension flag; the enqueuer skips the pipeline until resume
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    /// Clear the suspension flag
    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Set the completion signal
    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
        self.completion.notify_waiters();
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Park until the completion signal is set
    pub async fn wait_completed(&self) {
        loop {
            let notified = self.completion.notified();
            if self.is_completed() {
                return;
            }
            notified.await;
        }
    }

    /// Clone the underlying record
    pub async fn snapshot(&self) -> Pipeline {
        self.body.lock().await.clone()
    }
}

impl std::fmt::Debug for SharedPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPipeline")
            .field("uid", &self.uid)
            .field("suspended", &self.is_suspended())
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// An assigned workflow: the set of pipeline replicas for one side
///
/// Cloning shares the replicas; use [`Workflow::deep_copy`] to fork an
/// independent replica set for a worker.
#[derive(Debug, Clone, Default)]
pub struct Workflow {
    pipelines: Vec<Arc<SharedPipeline>>,
}

impl Workflow {
    /// Wrap pipeline records into a replica set
    pub fn new(pipelines: impl IntoIterator<Item = Pipeline>) -> Self {
        Self {
            pipelines: pipelines.into_iter().map(SharedPipeline::new).collect(),
        }
    }

    pub fn pipelines(&self) -> &[Arc<SharedPipeline>] {
        &self.pipelines
    }

    /// Find a pipeline by uid
    pub fn find(&self, uid: &str) -> Option<Arc<SharedPipeline>> {
        self.pipelines.iter().find(|p| p.uid() == uid).cloned()
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Check whether every pipeline's completion signal is set
    pub fn all_completed(&self) -> bool {
        !self.pipelines.is_empty() && self.pipelines.iter().all(|p| p.is_completed())
    }

    /// Fork an independent replica set with identical content
    pub async fn deep_copy(&self) -> Workflow {
        let mut pipelines = Vec::with_capacity(self.pipelines.len());
        for pipeline in &self.pipelines {
            let body = pipeline.snapshot().await;
            let copy = SharedPipeline::new(body);
            if pipeline.is_suspended() {
                copy.suspend();
            }
            if pipeline.is_completed() {
                copy.mark_completed();
            }
            pipelines.push(copy);
        }
        Workflow { pipelines }
    }

    /// Validate every pipeline record
    pub async fn validate(&self) -> Result<(), EngineError> {
        for pipeline in &self.pipelines {
            pipeline.lock().await.validate()?;
        }
        Ok(())
    }
}

impl From<Pipeline> for Workflow {
    fn from(pipeline: Pipeline) -> Self {
        Workflow::new([pipeline])
    }
}

impl From<Vec<Pipeline>> for Workflow {
    fn from(pipelines: Vec<Pipeline>) -> Self {
        Workflow::new(pipelines)
    }
}

/// Recorded suspend/resume requests from a post-exec callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ControlAction {
    Suspend(String),
    Resume(String),
}

/// Handle given to a post-exec callback
///
/// Mutations are builder-style and applied by the dequeuer after the callback
/// returns: appended stages join the pipeline, suspend/resume requests are
/// proposed through the synchronizer. Only stages that have not been
/// scheduled yet are directly mutable.
pub struct PostExecCtx<'a> {
    pipeline_uid: &'a str,
    finished_stage: &'a Stage,
    upcoming: &'a mut [Stage],
    appended: Vec<Stage>,
    control: Vec<ControlAction>,
    complete: bool,
}

impl<'a> PostExecCtx<'a> {
    pub(crate) fn new(
        pipeline_uid: &'a str,
        finished_stage: &'a Stage,
        upcoming: &'a mut [Stage],
    ) -> Self {
        Self {
            pipeline_uid,
            finished_stage,
            upcoming,
            appended: Vec::new(),
            control: Vec::new(),
            complete: false,
        }
    }

    /// Uid of the pipeline the finished stage belongs to
    pub fn pipeline_uid(&self) -> &str {
        self.pipeline_uid
    }

    /// The stage whose tasks just settled, including their exit codes
    pub fn finished_stage(&self) -> &Stage {
        self.finished_stage
    }

    /// Stages after the active one, read-only
    pub fn upcoming_stages(&self) -> &[Stage] {
        self.upcoming
    }

    /// Stages after the active one; arguments and tasks may be reshaped
    /// because nothing about them has been proposed yet
    pub fn upcoming_stages_mut(&mut self) -> &mut [Stage] {
        self.upcoming
    }

    /// Append a new stage to the end of this pipeline
    pub fn append_stage(&mut self, stage: Stage) {
        self.appended.push(stage);
    }

    /// Request suspension of a pipeline (usually another one)
    pub fn suspend(&mut self, pipeline_uid: impl Into<String>) {
        self.control.push(ControlAction::Suspend(pipeline_uid.into()));
    }

    /// Request resumption of a suspended pipeline
    pub fn resume(&mut self, pipeline_uid: impl Into<String>) {
        self.control.push(ControlAction::Resume(pipeline_uid.into()));
    }

    /// Declare this pipeline complete: remaining stages are abandoned and
    /// the pipeline is marked done once the current stage settles
    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    pub(crate) fn into_effects(self) -> PostExecEffects {
        PostExecEffects {
            appended: self.appended,
            control: self.control,
            complete: self.complete,
        }
    }
}

/// What a post-exec callback asked for, applied by the dequeuer
#[derive(Debug, Default)]
pub(crate) struct PostExecEffects {
    pub(crate) appended: Vec<Stage>,
    pub(crate) control: Vec<ControlAction>,
    pub(crate) complete: bool,
}
