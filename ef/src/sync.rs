//! The publish-and-await-ack synchronization protocol
//!
//! Every state transition anywhere in the system is proposed to the
//! synchronizer over the master queue and held until the synchronizer's
//! per-entity ack comes back on the proposer's dedicated reply queue. This
//! serializes all writes to the authoritative workflow replica through a
//! single thread.

use std::sync::Arc;
use std::time::Duration;

use relayq::{Broker, Properties};
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::states::State;
use crate::workflow::{Pipeline, Stage, Task};

/// A proposed state transition, tagged the way it travels on the wire:
/// `{"type": "Task", "object": {...}}`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "object")]
pub enum SyncProposal {
    Task(Task),
    Stage(Stage),
    Pipeline(Pipeline),
}

impl SyncProposal {
    /// Uid of the entity the proposal targets
    pub fn uid(&self) -> &str {
        match self {
            SyncProposal::Task(t) => &t.uid,
            SyncProposal::Stage(s) => &s.uid,
            SyncProposal::Pipeline(p) => &p.uid,
        }
    }

    /// Proposed state
    pub fn state(&self) -> State {
        match self {
            SyncProposal::Task(t) => t.state,
            SyncProposal::Stage(s) => s.state,
            SyncProposal::Pipeline(p) => p.state,
        }
    }

    /// Wire tag of the entity kind
    pub fn kind(&self) -> &'static str {
        match self {
            SyncProposal::Task(_) => "Task",
            SyncProposal::Stage(_) => "Stage",
            SyncProposal::Pipeline(_) => "Pipeline",
        }
    }

    /// The ack body the synchronizer answers with
    pub fn ack_body(&self) -> String {
        format!("{}-ack", self.uid())
    }
}

/// Proposer side of the protocol
///
/// Each worker owns one client bound to its dedicated reply queue. A
/// proposal is published with a fresh correlation id; the client blocks until
/// the matching `<uid>-ack` arrives. On timeout the identical proposal is
/// resubmitted, which is safe because the synchronizer is a no-op when states
/// already match and acks unconditionally.
pub struct SyncClient {
    broker: Arc<Broker>,
    master_queue: String,
    reply_queue: String,
    ack_timeout: Duration,
    max_attempts: u32,
}

impl SyncClient {
    pub fn new(
        broker: Arc<Broker>,
        master_queue: impl Into<String>,
        reply_queue: impl Into<String>,
        ack_timeout: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            broker,
            master_queue: master_queue.into(),
            reply_queue: reply_queue.into(),
            ack_timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Propose one transition and block until it is acknowledged
    pub async fn propose(&self, proposal: &SyncProposal) -> Result<(), EngineError> {
        let uid = proposal.uid().to_string();
        let expected = proposal.ack_body();
        let body = serde_json::to_vec(proposal)?;

        for attempt in 1..=self.max_attempts {
            let correlation_id = Uuid::now_v7().to_string();
            self.broker
                .publish(
                    &self.master_queue,
                    body.clone(),
                    Properties::request(self.reply_queue.as_str(), correlation_id.as_str()),
                )
                .await?;
            trace!(
                uid = %uid,
                kind = proposal.kind(),
                state = %proposal.state(),
                attempt,
                "transition proposed"
            );

            if self.await_ack(&correlation_id, &expected).await? {
                return Ok(());
            }
            warn!(uid = %uid, attempt, "ack timed out, resubmitting proposal");
        }

        Err(EngineError::AckTimeout {
            uid,
            attempts: self.max_attempts,
        })
    }

    /// Propose a task transition
    pub async fn task(&self, task: &Task) -> Result<(), EngineError> {
        self.propose(&SyncProposal::Task(task.clone())).await
    }

    /// Propose a stage transition
    pub async fn stage(&self, stage: &Stage) -> Result<(), EngineError> {
        self.propose(&SyncProposal::Stage(stage.clone())).await
    }

    /// Propose a pipeline transition
    pub async fn pipeline(&self, pipeline: &Pipeline) -> Result<(), EngineError> {
        self.propose(&SyncProposal::Pipeline(pipeline.clone())).await
    }

    /// Wait one ack-timeout for the matching reply; stale acks from earlier
    /// resubmissions are drained and discarded
    async fn await_ack(&self, correlation_id: &str, expected: &str) -> Result<bool, EngineError> {
        let deadline = tokio::time::Instant::now() + self.ack_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            match self.broker.get_timeout(&self.reply_queue, remaining).await? {
                Some(delivery) => {
                    self.broker.ack(&self.reply_queue, delivery.delivery_tag).await?;
                    if delivery.properties.correlates_with(correlation_id)
                        && delivery.text() == expected
                    {
                        return Ok(true);
                    }
                    warn!(reply_queue = %self.reply_queue, "discarding stale ack");
                }
                None => return Ok(false),
            }
        }
    }
}
