//! Dequeuer: absorbs completed tasks and advances stages and pipelines

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use relayq::{Broker, Properties};
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::states::State;
use crate::sync::SyncClient;
use crate::worker::TerminateEvent;
use crate::workflow::{
    ControlAction, MAX_TASK_ATTEMPTS, Pipeline, PostExecCtx, PostExecEffects, SharedPipeline,
    Task, TaskFailurePolicy, Workflow,
};

const GET_POLL: Duration = Duration::from_millis(200);

pub(crate) struct Dequeuer {
    pub(crate) workflow: Workflow,
    pub(crate) broker: Arc<Broker>,
    pub(crate) completed: Vec<String>,
    pub(crate) pending: Vec<String>,
    pub(crate) sync: SyncClient,
    pub(crate) terminate: Arc<TerminateEvent>,
    pub(crate) resubmit_cursor: AtomicUsize,
}

impl Dequeuer {
    /// Consume the completed queues until terminated
    pub(crate) async fn run(self) {
        info!("dequeuer started");
        let mut cursor = 0usize;

        while !self.terminate.is_set() {
            let queue = self.completed[cursor % self.completed.len()].clone();
            cursor += 1;

            match self.broker.get_timeout(&queue, GET_POLL).await {
                Ok(Some(delivery)) => {
                    let tasks: Vec<Task> = match serde_json::from_slice(&delivery.body) {
                        Ok(tasks) => tasks,
                        Err(err) => {
                            error!(error = %err, queue, "dropping undecodable completion");
                            let _ = self.broker.ack(&queue, delivery.delivery_tag).await;
                            continue;
                        }
                    };

                    let mut absorbed = true;
                    for task in tasks {
                        if let Err(err) = self.absorb(task).await {
                            error!(error = %err, "dequeuer giving up");
                            absorbed = false;
                            break;
                        }
                    }
                    if !absorbed {
                        return;
                    }
                    let _ = self.broker.ack(&queue, delivery.delivery_tag).await;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, queue, "completed queue fetch failed");
                    tokio::time::sleep(GET_POLL).await;
                }
            }
        }

        info!("dequeuer stopped");
    }

    /// Fold one terminal task back into the workflow
    async fn absorb(&self, task: Task) -> Result<(), EngineError> {
        debug!(uid = %task.uid, state = %task.state, exit_code = ?task.exit_code, "absorbing task");

        // Re-affirm the terminal state; a no-op when the task manager's own
        // update already landed
        self.sync.task(&task).await?;

        let Some(pipeline_uid) = task.parent_pipeline.clone() else {
            warn!(uid = %task.uid, "completed task has no parent pipeline");
            return Ok(());
        };
        let Some(pipeline) = self.workflow.find(&pipeline_uid) else {
            warn!(uid = %task.uid, pipeline = %pipeline_uid, "completed task for unknown pipeline");
            return Ok(());
        };

        let mut body = pipeline.lock().await;

        let Some(stage_idx) = task
            .parent_stage
            .as_deref()
            .and_then(|uid| body.stage_index(uid))
        else {
            warn!(uid = %task.uid, "completed task for unknown stage");
            return Ok(());
        };

        // A duplicate completion for an already settled stage (redelivery
        // after a task manager respawn) must not re-fire anything
        if body.stages[stage_idx].state.is_terminal() {
            debug!(uid = %task.uid, "stage already settled, dropping duplicate");
            return Ok(());
        }

        // Mirror the outcome into this replica
        if let Some(replica) = body.stages[stage_idx].task_mut(&task.uid) {
            if replica.state != task.state {
                replica.state = task.state;
                replica.state_history.push(task.state);
            }
            replica.exit_code = task.exit_code;
            replica.path = task.path.clone();
            replica.attempts = replica.attempts.max(task.attempts);
        } else {
            warn!(uid = %task.uid, "completed task not present in stage");
            return Ok(());
        }

        if task.state == State::Failed {
            match body.on_task_failure {
                TaskFailurePolicy::Continue => {}
                TaskFailurePolicy::Resubmit if task.attempts < MAX_TASK_ATTEMPTS => {
                    return self.resubmit(&mut body, stage_idx, &task.uid).await;
                }
                // FailStage, or a resubmit budget that ran dry
                _ => {
                    return self.fail_stage(&pipeline, &mut body, stage_idx).await;
                }
            }
        }

        if !body.stages[stage_idx].tasks_terminal() {
            return Ok(());
        }

        // Stage settled: COMPLETING, then the post-exec callback, then DONE
        body.stages[stage_idx].set_state(State::Completing);
        self.sync.stage(&body.stages[stage_idx]).await?;

        let hook = body.stages[stage_idx].post_exec.clone();
        let mut effects = PostExecEffects::default();
        if let Some(hook) = hook {
            let pipeline_uid = body.uid.clone();
            let (settled, upcoming) = body.stages.split_at_mut(stage_idx + 1);
            let mut ctx = PostExecCtx::new(&pipeline_uid, &settled[stage_idx], upcoming);
            match hook(&mut ctx) {
                Ok(()) => effects = ctx.into_effects(),
                Err(err) => {
                    error!(
                        stage = %settled[stage_idx].uid,
                        error = ?err,
                        "post-exec callback failed"
                    );
                    return self.fail_stage(&pipeline, &mut body, stage_idx).await;
                }
            }
        }

        // Callback-induced mutations are published before the stage's DONE
        for stage in effects.appended {
            body.add_stage(stage);
            let adopted = body.stages.last().expect("stage was just appended");
            info!(stage = %adopted.uid, pipeline = %body.uid, "stage appended at runtime");
            self.sync.stage(adopted).await?;
        }
        for action in effects.control {
            self.apply_control(&pipeline, &mut body, action).await?;
        }

        body.stages[stage_idx].set_state(State::Done);
        self.sync.stage(&body.stages[stage_idx]).await?;
        debug!(stage = %body.stages[stage_idx].uid, "stage done");

        body.current_stage += 1;
        if effects.complete {
            // The callback declared the pipeline finished; abandon whatever
            // stages remain unscheduled
            body.current_stage = body.stages.len();
        }
        if body.current_stage >= body.stages.len() {
            body.set_state(State::Done);
            body.completed = true;
            self.sync.pipeline(&body).await?;
            pipeline.mark_completed();
            info!(pipeline = %body.uid, "pipeline completed");
        }

        Ok(())
    }

    /// Re-queue a failed task for another run
    async fn resubmit(
        &self,
        body: &mut Pipeline,
        stage_idx: usize,
        task_uid: &str,
    ) -> Result<(), EngineError> {
        let replica = body.stages[stage_idx]
            .task_mut(task_uid)
            .expect("task located by caller");
        replica.exit_code = None;
        replica.set_state(State::Scheduling);
        self.sync.task(replica).await?;

        let idx = self.resubmit_cursor.fetch_add(1, Ordering::Relaxed) % self.pending.len();
        let queue = &self.pending[idx];
        let payload = serde_json::to_vec(std::slice::from_ref(&*replica))?;
        self.broker.publish(queue, payload, Properties::default()).await?;

        replica.set_state(State::Scheduled);
        warn!(uid = %task_uid, attempts = replica.attempts, queue, "failed task resubmitted");
        self.sync.task(replica).await?;
        Ok(())
    }

    /// Fail the stage and with it the pipeline
    async fn fail_stage(
        &self,
        pipeline: &Arc<SharedPipeline>,
        body: &mut Pipeline,
        stage_idx: usize,
    ) -> Result<(), EngineError> {
        warn!(stage = %body.stages[stage_idx].uid, pipeline = %body.uid, "failing stage");

        body.stages[stage_idx].set_state(State::Failed);
        self.sync.stage(&body.stages[stage_idx]).await?;

        body.set_state(State::Failed);
        body.completed = true;
        self.sync.pipeline(body).await?;
        pipeline.mark_completed();
        Ok(())
    }

    /// Apply a suspend/resume request recorded by a post-exec callback
    async fn apply_control(
        &self,
        current: &Arc<SharedPipeline>,
        body: &mut Pipeline,
        action: ControlAction,
    ) -> Result<(), EngineError> {
        match action {
            ControlAction::Suspend(uid) => {
                if uid == body.uid {
                    current.suspend();
                    if body.state == State::Running {
                        body.set_state(State::Suspended);
                        self.sync.pipeline(body).await?;
                    }
                    info!(pipeline = %uid, "pipeline suspended");
                    return Ok(());
                }
                let Some(other) = self.workflow.find(&uid) else {
                    warn!(pipeline = %uid, "suspend request for unknown pipeline");
                    return Ok(());
                };
                other.suspend();
                let mut other_body = other.lock().await;
                if other_body.state == State::Running {
                    other_body.set_state(State::Suspended);
                    self.sync.pipeline(&other_body).await?;
                }
                info!(pipeline = %uid, "pipeline suspended");
            }
            ControlAction::Resume(uid) => {
                if uid == body.uid {
                    current.resume();
                    if body.state == State::Suspended {
                        body.set_state(State::Running);
                        self.sync.pipeline(body).await?;
                    }
                    info!(pipeline = %uid, "pipeline resumed");
                    return Ok(());
                }
                let Some(other) = self.workflow.find(&uid) else {
                    warn!(pipeline = %uid, "resume request for unknown pipeline");
                    return Ok(());
                };
                other.resume();
                let mut other_body = other.lock().await;
                if other_body.state == State::Suspended {
                    other_body.set_state(State::Running);
                    self.sync.pipeline(&other_body).await?;
                }
                info!(pipeline = %uid, "pipeline resumed");
            }
        }
        Ok(())
    }
}
