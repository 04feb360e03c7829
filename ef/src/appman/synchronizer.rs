//! The single writer of the authoritative workflow replica
//!
//! Consumes state-change proposals from the master queue, applies them to
//! the application manager's replica under the owning pipeline's stage lock,
//! and answers each proposal with a per-entity ack. The entity ack is
//! published *before* the broker delivery is acked: a crash between the two
//! leaves the proposal redeliverable, and re-applying it is a no-op.

use std::sync::Arc;
use std::time::Duration;

use relayq::{Broker, Delivery, Properties};
use tracing::{debug, error, info, warn};

use crate::error::EngineError;
use crate::states::State;
use crate::sync::SyncProposal;
use crate::worker::TerminateEvent;
use crate::workflow::{Pipeline, Stage, Task, Workflow};

const GET_POLL: Duration = Duration::from_millis(200);

/// Synchronizer task state
pub struct Synchronizer {
    workflow: Workflow,
    broker: Arc<Broker>,
    master_queue: String,
    terminate: Arc<TerminateEvent>,
}

impl Synchronizer {
    pub fn new(
        workflow: Workflow,
        broker: Arc<Broker>,
        master_queue: impl Into<String>,
        terminate: Arc<TerminateEvent>,
    ) -> Self {
        Self {
            workflow,
            broker,
            master_queue: master_queue.into(),
            terminate,
        }
    }

    /// Pull and apply proposals until the terminate event trips
    pub async fn run(self) {
        info!(queue = %self.master_queue, "synchronizer started");

        while !self.terminate.is_set() {
            match self.broker.get_timeout(&self.master_queue, GET_POLL).await {
                Ok(Some(delivery)) => {
                    if let Err(err) = self.handle(delivery).await {
                        error!(error = %err, "failed to process proposal");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "master queue fetch failed");
                    tokio::time::sleep(GET_POLL).await;
                }
            }
        }

        info!("synchronizer stopped");
    }

    async fn handle(&self, delivery: Delivery) -> Result<(), EngineError> {
        let proposal: SyncProposal = match serde_json::from_slice(&delivery.body) {
            Ok(proposal) => proposal,
            Err(err) => {
                error!(error = %err, "dropping undecodable proposal");
                self.broker.ack(&self.master_queue, delivery.delivery_tag).await?;
                return Ok(());
            }
        };

        match &proposal {
            SyncProposal::Task(task) => self.apply_task(task).await,
            SyncProposal::Stage(stage) => self.apply_stage(stage).await,
            SyncProposal::Pipeline(pipeline) => self.apply_pipeline(pipeline).await,
        }

        // Entity ack first, broker ack second
        if let Some(reply_to) = &delivery.properties.reply_to {
            let correlation_id = delivery.properties.correlation_id.clone().unwrap_or_default();
            self.broker
                .publish(
                    reply_to,
                    proposal.ack_body().into_bytes(),
                    Properties::reply(correlation_id),
                )
                .await?;
        }
        self.broker.ack(&self.master_queue, delivery.delivery_tag).await?;
        Ok(())
    }

    async fn apply_task(&self, update: &Task) {
        let Some(pipeline) = update
            .parent_pipeline
            .as_deref()
            .and_then(|uid| self.workflow.find(uid))
        else {
            warn!(uid = %update.uid, "task update without a known parent pipeline");
            return;
        };

        let mut body = pipeline.lock().await;
        let Some(stage_uid) = update.parent_stage.as_deref() else {
            warn!(uid = %update.uid, "task update without a parent stage");
            return;
        };
        let Some(stage) = body.stage_mut(stage_uid) else {
            warn!(uid = %update.uid, stage = %stage_uid, "task update for an unknown stage");
            return;
        };
        let Some(replica) = stage.task_mut(&update.uid) else {
            warn!(uid = %update.uid, "task update for an unknown task");
            return;
        };

        if replica.state != update.state {
            debug!(uid = %update.uid, from = %replica.state, to = %update.state, "task synced");
            replica.set_state(update.state);
        }
        // Mirrored attributes travel with every update
        if update.path.is_some() {
            replica.path = update.path.clone();
        }
        if update.exit_code.is_some() {
            replica.exit_code = update.exit_code;
        }
        replica.attempts = replica.attempts.max(update.attempts);
    }

    async fn apply_stage(&self, update: &Stage) {
        let Some(pipeline) = update
            .parent_pipeline
            .as_deref()
            .and_then(|uid| self.workflow.find(uid))
        else {
            warn!(uid = %update.uid, "stage update without a known parent pipeline");
            return;
        };

        let mut body = pipeline.lock().await;
        match body.stage_mut(&update.uid) {
            Some(replica) => {
                if replica.state != update.state {
                    debug!(uid = %update.uid, from = %replica.state, to = %update.state, "stage synced");
                    replica.set_state(update.state);
                }
            }
            None => {
                // A stage inserted at runtime by a post-exec callback; adopt
                // it so this replica keeps describing the whole pipeline
                info!(uid = %update.uid, pipeline = %body.uid, "adopting runtime-inserted stage");
                body.add_stage(update.clone());
            }
        }
    }

    async fn apply_pipeline(&self, update: &Pipeline) {
        let Some(pipeline) = self.workflow.find(&update.uid) else {
            warn!(uid = %update.uid, "update for an unknown pipeline");
            return;
        };

        let mut body = pipeline.lock().await;
        if body.state != update.state {
            debug!(uid = %update.uid, from = %body.state, to = %update.state, "pipeline synced");
            body.set_state(update.state);
        }
        match update.state {
            State::Suspended => pipeline.suspend(),
            State::Running => pipeline.resume(),
            _ => {}
        }
        if update.completed {
            body.completed = true;
        }
        if body.completed || body.state.is_terminal() {
            pipeline.mark_completed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncClient;
    use crate::workflow::Stage;

    const MASTER: &str = "sync-to-master";
    const REPLY: &str = "sync-ack-test";

    fn two_task_workflow() -> Workflow {
        let mut pipeline = Pipeline::new();
        let mut stage = Stage::new();
        stage.add_task(Task::new().with_executable("/bin/echo").with_arguments(["a"]));
        stage.add_task(Task::new().with_executable("/bin/echo").with_arguments(["b"]));
        pipeline.add_stage(stage);
        Workflow::new([pipeline])
    }

    async fn wired(workflow: &Workflow) -> (Arc<Broker>, SyncClient, Arc<TerminateEvent>) {
        let broker = Arc::new(Broker::new());
        broker.queue_declare(MASTER, true).await;
        broker.queue_declare(REPLY, true).await;

        let terminate = TerminateEvent::new();
        let synchronizer = Synchronizer::new(
            workflow.clone(),
            broker.clone(),
            MASTER,
            terminate.clone(),
        );
        tokio::spawn(synchronizer.run());

        let client = SyncClient::new(
            broker.clone(),
            MASTER,
            REPLY,
            Duration::from_secs(2),
            3,
        );
        (broker, client, terminate)
    }

    #[tokio::test]
    async fn test_task_state_and_attributes_synced() {
        let workflow = two_task_workflow();
        let (_broker, client, terminate) = wired(&workflow).await;

        let mut update = workflow.pipelines()[0].lock().await.stages[0].tasks[0].clone();
        update.set_state(State::Running);
        update.path = Some("/scratch/t0".to_string());
        update.exit_code = Some(0);
        client.task(&update).await.unwrap();

        let body = workflow.pipelines()[0].lock().await;
        let replica = &body.stages[0].tasks[0];
        assert_eq!(replica.state, State::Running);
        assert_eq!(replica.path.as_deref(), Some("/scratch/t0"));
        assert_eq!(replica.exit_code, Some(0));

        terminate.set();
    }

    #[tokio::test]
    async fn test_reapplication_is_noop() {
        let workflow = two_task_workflow();
        let (_broker, client, terminate) = wired(&workflow).await;

        let mut update = workflow.pipelines()[0].lock().await.stages[0].tasks[0].clone();
        update.set_state(State::Done);
        client.task(&update).await.unwrap();
        client.task(&update).await.unwrap();
        client.task(&update).await.unwrap();

        let body = workflow.pipelines()[0].lock().await;
        let replica = &body.stages[0].tasks[0];
        // One applied transition, no matter how many deliveries
        let done_count = replica
            .state_history
            .iter()
            .filter(|s| **s == State::Done)
            .count();
        assert_eq!(done_count, 1);

        terminate.set();
    }

    #[tokio::test]
    async fn test_unknown_stage_is_adopted() {
        let workflow = two_task_workflow();
        let (_broker, client, terminate) = wired(&workflow).await;

        let pipeline_uid = workflow.pipelines()[0].uid().to_string();
        let mut inserted = Stage::new().with_name("runtime-stage");
        inserted.add_task(Task::new().with_executable("/bin/true"));
        inserted.parent_pipeline = Some(pipeline_uid);
        client.stage(&inserted).await.unwrap();

        let body = workflow.pipelines()[0].lock().await;
        assert_eq!(body.stages.len(), 2);
        assert_eq!(body.stages[1].uid, inserted.uid);

        terminate.set();
    }

    #[tokio::test]
    async fn test_terminal_pipeline_sets_completion_signal() {
        let workflow = two_task_workflow();
        let (_broker, client, terminate) = wired(&workflow).await;

        let mut update = workflow.pipelines()[0].lock().await.clone();
        update.set_state(State::Done);
        update.completed = true;
        client.pipeline(&update).await.unwrap();

        assert!(workflow.pipelines()[0].is_completed());

        terminate.set();
    }

    #[tokio::test]
    async fn test_suspension_mirrors_flag() {
        let workflow = two_task_workflow();
        let (_broker, client, terminate) = wired(&workflow).await;

        let mut update = workflow.pipelines()[0].lock().await.clone();
        update.set_state(State::Running);
        client.pipeline(&update).await.unwrap();
        update.set_state(State::Suspended);
        client.pipeline(&update).await.unwrap();
        assert!(workflow.pipelines()[0].is_suspended());

        update.set_state(State::Running);
        client.pipeline(&update).await.unwrap();
        assert!(!workflow.pipelines()[0].is_suspended());

        terminate.set();
    }

    #[tokio::test]
    async fn test_unknown_entity_still_acked() {
        let workflow = two_task_workflow();
        let (_broker, client, terminate) = wired(&workflow).await;

        // A task pointing at a pipeline this replica has never seen: the
        // proposal must still be acked or the proposer would spin forever
        let mut stray = Task::new().with_executable("/bin/true");
        stray.parent_pipeline = Some("pipeline.ghost".to_string());
        stray.parent_stage = Some("stage.ghost".to_string());
        stray.set_state(State::Done);
        client.task(&stray).await.unwrap();

        terminate.set();
    }
}
