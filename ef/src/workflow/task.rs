//! Task - the atomic unit of scheduling

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::states::State;

use super::{generate_uid, now_ms};

/// CPU requirements of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuReqs {
    pub processes: u32,
    #[serde(rename = "threads-per-process")]
    pub threads_per_process: u32,
}

impl Default for CpuReqs {
    fn default() -> Self {
        Self {
            processes: 1,
            threads_per_process: 1,
        }
    }
}

/// GPU requirements of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GpuReqs {
    pub processes: u32,
}

/// A single executable invocation
///
/// Created by user code; once assigned, its state is mutated exclusively by
/// the synchronizer on behalf of worker messages. Parent links are uids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    pub uid: String,

    /// User-provided identifier, not required to be unique
    pub name: String,

    pub state: State,

    /// Every state this task has held, in order of application
    #[serde(rename = "state-history")]
    pub state_history: Vec<State>,

    pub executable: String,
    pub arguments: Vec<String>,

    /// Shell commands run before the executable, in its working directory
    #[serde(rename = "pre-exec")]
    pub pre_exec: Vec<String>,

    /// Shell commands run after the executable
    #[serde(rename = "post-exec")]
    pub post_exec: Vec<String>,

    #[serde(rename = "cpu-reqs")]
    pub cpu_reqs: CpuReqs,

    #[serde(rename = "gpu-reqs")]
    pub gpu_reqs: GpuReqs,

    /// Files uploaded from the client into the task sandbox
    #[serde(rename = "upload-input-data")]
    pub upload_input_data: Vec<String>,

    /// Files copied into the sandbox from elsewhere on the resource
    #[serde(rename = "copy-input-data")]
    pub copy_input_data: Vec<String>,

    /// Files copied out of the sandbox after execution
    #[serde(rename = "copy-output-data")]
    pub copy_output_data: Vec<String>,

    /// Files downloaded back to the client after execution
    #[serde(rename = "download-output-data")]
    pub download_output_data: Vec<String>,

    /// Stdout file name inside the sandbox; defaults to `<uid>.out`
    pub stdout: Option<String>,

    /// Stderr file name inside the sandbox; defaults to `<uid>.err`
    pub stderr: Option<String>,

    /// Working directory assigned by the runtime system
    pub path: Option<String>,

    #[serde(rename = "exit-code")]
    pub exit_code: Option<i32>,

    /// Submission attempts, bumped on every resubmission
    pub attempts: u32,

    #[serde(rename = "parent-stage")]
    pub parent_stage: Option<String>,

    #[serde(rename = "parent-pipeline")]
    pub parent_pipeline: Option<String>,

    #[serde(rename = "created-at")]
    pub created_at: i64,
}

impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}

impl Task {
    /// Create an empty task with a fresh uid
    pub fn new() -> Self {
        Self {
            uid: generate_uid("task"),
            name: String::new(),
            state: State::Initial,
            state_history: vec![State::Initial],
            executable: String::new(),
            arguments: Vec::new(),
            pre_exec: Vec::new(),
            post_exec: Vec::new(),
            cpu_reqs: CpuReqs::default(),
            gpu_reqs: GpuReqs::default(),
            upload_input_data: Vec::new(),
            copy_input_data: Vec::new(),
            copy_output_data: Vec::new(),
            download_output_data: Vec::new(),
            stdout: None,
            stderr: None,
            path: None,
            exit_code: None,
            attempts: 0,
            parent_stage: None,
            parent_pipeline: None,
            created_at: now_ms(),
        }
    }

    /// Builder method to set the user name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Builder method to set the executable
    pub fn with_executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = executable.into();
        self
    }

    /// Builder method to set the argument list
    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    /// Apply a state and record it in the history
    pub fn set_state(&mut self, state: State) {
        self.state = state;
        self.state_history.push(state);
    }

    /// Check whether the task has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Check the task is runnable: an executable must be set
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.executable.trim().is_empty() {
            return Err(EngineError::missing(format!("task {}", self.uid), "executable"));
        }
        Ok(())
    }

    /// Serialize to a JSON value
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("task serialization is infallible")
    }

    /// Deserialize from a JSON value
    pub fn from_dict(value: &serde_json::Value) -> Result<Self, EngineError> {
        Ok(serde_json::from_value(value.clone())?)
    }
}
