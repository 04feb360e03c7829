//! Enqueuer: pushes schedulable stages onto the pending queues

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use relayq::{Broker, Properties};
use tracing::{debug, error, info};

use crate::error::EngineError;
use crate::states::State;
use crate::sync::SyncClient;
use crate::worker::TerminateEvent;
use crate::workflow::{SharedPipeline, Workflow};

const IDLE_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) struct Enqueuer {
    pub(crate) workflow: Workflow,
    pub(crate) broker: Arc<Broker>,
    pub(crate) pending: Vec<String>,
    pub(crate) sync: SyncClient,
    pub(crate) terminate: Arc<TerminateEvent>,
}

impl Enqueuer {
    /// Walk the pipelines until terminated, backing off when nothing moves
    pub(crate) async fn run(self) {
        info!("enqueuer started");
        let mut cursor = 0usize;

        while !self.terminate.is_set() {
            let mut progressed = false;

            for pipeline in self.workflow.pipelines() {
                if self.terminate.is_set() {
                    break;
                }
                if pipeline.is_suspended() || pipeline.is_completed() {
                    continue;
                }
                match self.schedule_pass(pipeline, &mut cursor).await {
                    Ok(scheduled) => progressed |= scheduled,
                    Err(err) => {
                        error!(pipeline = pipeline.uid(), error = %err, "enqueuer giving up");
                        return;
                    }
                }
            }

            if progressed {
                tokio::task::yield_now().await;
            } else {
                // Jitter keeps concurrent sessions from phase-locking
                let jitter = rand::rng().random_range(0..50);
                tokio::time::sleep(IDLE_BACKOFF + Duration::from_millis(jitter)).await;
            }
        }

        info!("enqueuer stopped");
    }

    /// Schedule the pipeline's active stage if it is still untouched
    async fn schedule_pass(
        &self,
        pipeline: &Arc<SharedPipeline>,
        cursor: &mut usize,
    ) -> Result<bool, EngineError> {
        let mut body = pipeline.lock().await;

        if body.state.is_terminal() {
            return Ok(false);
        }
        let idx = body.current_stage;
        if idx >= body.stages.len() || body.stages[idx].state != State::Initial {
            return Ok(false);
        }

        // First schedule moves the pipeline onto the ladder
        if body.state == State::Initial {
            body.set_state(State::Running);
            self.sync.pipeline(&body).await?;
        }

        // Tasks enter SCHEDULING before they hit the wire
        for task in body.stages[idx].tasks.iter_mut() {
            task.set_state(State::Scheduling);
        }
        for task in body.stages[idx].tasks.iter() {
            self.sync.task(task).await?;
        }
        body.stages[idx].set_state(State::Scheduling);
        self.sync.stage(&body.stages[idx]).await?;

        // The whole stage goes out as one batch
        let queue = &self.pending[*cursor % self.pending.len()];
        *cursor += 1;
        let payload = serde_json::to_vec(&body.stages[idx].tasks)?;
        self.broker.publish(queue, payload, Properties::default()).await?;
        debug!(
            stage = %body.stages[idx].uid,
            tasks = body.stages[idx].tasks.len(),
            queue,
            "stage enqueued"
        );

        for task in body.stages[idx].tasks.iter_mut() {
            task.set_state(State::Scheduled);
        }
        for task in body.stages[idx].tasks.iter() {
            self.sync.task(task).await?;
        }
        body.stages[idx].set_state(State::Scheduled);
        self.sync.stage(&body.stages[idx]).await?;

        Ok(true)
    }
}
