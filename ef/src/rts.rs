//! Runtime system contract and the local implementation
//!
//! The runtime system is what actually places tasks on compute. The engine
//! only ever sees it through [`Rts`]: submit a task, watch its transitions
//! stream back. [`LocalRts`] runs tasks as local processes under a sandbox
//! directory, which is all the engine needs outside a cluster.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::states::State;
use crate::workflow::Task;

/// Errors surfaced by runtime-system operations
#[derive(Debug, Error)]
pub enum RtsError {
    #[error("runtime system rejected task '{uid}': {reason}")]
    Rejected { uid: String, reason: String },

    #[error("failed to launch '{executable}': {source}")]
    Launch {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o failure for task '{uid}': {source}")]
    Io {
        uid: String,
        #[source]
        source: std::io::Error,
    },
}

/// A transition reported by the runtime system for a submitted task
#[derive(Debug, Clone)]
pub struct RtsUpdate {
    pub uid: String,
    /// `Running`, then `Done` or `Failed`
    pub state: State,
    pub exit_code: Option<i32>,
    /// Working directory the task ran in
    pub path: Option<String>,
}

/// The runtime system contract
///
/// `submit` accepts one task; transitions stream back on the returned
/// channel, ending with a terminal update. Dropping the receiver abandons
/// the watch, not the task.
#[async_trait]
pub trait Rts: Send + Sync {
    async fn submit(&self, task: &Task) -> Result<mpsc::Receiver<RtsUpdate>, RtsError>;
}

/// Executes tasks as local processes under a sandbox directory
///
/// Each task gets `<sandbox>/<uid>` as its working directory; pre-exec
/// commands, the executable and post-exec commands run there in order, with
/// stdout/stderr captured to files.
pub struct LocalRts {
    sandbox: PathBuf,
}

impl LocalRts {
    pub fn new(sandbox: impl Into<PathBuf>) -> Self {
        Self {
            sandbox: sandbox.into(),
        }
    }

    pub fn sandbox(&self) -> &Path {
        &self.sandbox
    }

    async fn run_shell(cmd: &str, dir: &Path, uid: &str) -> Result<i32, RtsError> {
        let status = Command::new("/bin/sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(dir)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|source| RtsError::Io {
                uid: uid.to_string(),
                source,
            })?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn execute(task: &Task, dir: &Path) -> Result<i32, RtsError> {
        for cmd in &task.pre_exec {
            let code = Self::run_shell(cmd, dir, &task.uid).await?;
            if code != 0 {
                warn!(uid = %task.uid, cmd, code, "pre-exec command failed");
                return Ok(code);
            }
        }

        let stdout_name = task
            .stdout
            .clone()
            .unwrap_or_else(|| format!("{}.out", task.uid));
        let stderr_name = task
            .stderr
            .clone()
            .unwrap_or_else(|| format!("{}.err", task.uid));
        let stdout_file = std::fs::File::create(dir.join(stdout_name)).map_err(|source| {
            RtsError::Io {
                uid: task.uid.clone(),
                source,
            }
        })?;
        let stderr_file = std::fs::File::create(dir.join(stderr_name)).map_err(|source| {
            RtsError::Io {
                uid: task.uid.clone(),
                source,
            }
        })?;

        let status = Command::new(&task.executable)
            .args(&task.arguments)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file))
            .status()
            .await
            .map_err(|source| RtsError::Launch {
                executable: task.executable.clone(),
                source,
            })?;
        let code = status.code().unwrap_or(-1);
        if code != 0 {
            return Ok(code);
        }

        for cmd in &task.post_exec {
            let code = Self::run_shell(cmd, dir, &task.uid).await?;
            if code != 0 {
                warn!(uid = %task.uid, cmd, code, "post-exec command failed");
                return Ok(code);
            }
        }
        Ok(code)
    }
}

#[async_trait]
impl Rts for LocalRts {
    async fn submit(&self, task: &Task) -> Result<mpsc::Receiver<RtsUpdate>, RtsError> {
        if task.executable.trim().is_empty() {
            return Err(RtsError::Rejected {
                uid: task.uid.clone(),
                reason: "no executable".to_string(),
            });
        }

        let dir = self.sandbox.join(&task.uid);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| RtsError::Io {
                uid: task.uid.clone(),
                source,
            })?;

        let (tx, rx) = mpsc::channel(4);
        let task = task.clone();
        tokio::spawn(async move {
            let path = dir.display().to_string();
            let _ = tx
                .send(RtsUpdate {
                    uid: task.uid.clone(),
                    state: State::Running,
                    exit_code: None,
                    path: Some(path.clone()),
                })
                .await;

            let update = match LocalRts::execute(&task, &dir).await {
                Ok(code) => {
                    debug!(uid = %task.uid, code, "task finished");
                    RtsUpdate {
                        uid: task.uid.clone(),
                        state: if code == 0 { State::Done } else { State::Failed },
                        exit_code: Some(code),
                        path: Some(path),
                    }
                }
                Err(err) => {
                    warn!(uid = %task.uid, error = %err, "task execution failed");
                    RtsUpdate {
                        uid: task.uid.clone(),
                        state: State::Failed,
                        exit_code: None,
                        path: Some(path),
                    }
                }
            };
            let _ = tx.send(update).await;
        });

        Ok(rx)
    }
}
