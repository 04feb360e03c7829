//! Workflow processor worker shell

use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use relayq::Broker;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::appman::QueueTopology;
use crate::config::EngineConfig;
use crate::heartbeat::HeartbeatResponder;
use crate::sync::SyncClient;
use crate::worker::TerminateEvent;
use crate::workflow::Workflow;

use super::{Dequeuer, Enqueuer};

/// The workflow processor: enqueuer + dequeuer + heartbeat responder
///
/// Operates on its own workflow replica; the application manager hands one
/// over on construction and builds a fresh one for every respawn.
pub struct WfProcessor {
    workflow: Workflow,
    broker: Arc<Broker>,
    topology: QueueTopology,
    config: EngineConfig,
    terminate: Arc<TerminateEvent>,
    enqueuer_handle: Option<JoinHandle<()>>,
    dequeuer_handle: Option<JoinHandle<()>>,
    heartbeat_handle: Option<JoinHandle<()>>,
}

impl WfProcessor {
    pub fn new(
        workflow: Workflow,
        broker: Arc<Broker>,
        topology: QueueTopology,
        config: &EngineConfig,
    ) -> Self {
        Self {
            workflow,
            broker,
            topology,
            config: config.clone(),
            terminate: TerminateEvent::new(),
            enqueuer_handle: None,
            dequeuer_handle: None,
            heartbeat_handle: None,
        }
    }

    /// This processor's workflow replica
    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Spawn enqueuer, dequeuer and the heartbeat responder
    pub fn start_processor(&mut self) {
        if self.enqueuer_handle.is_some() {
            warn!("workflow processor already started");
            return;
        }

        let enqueuer = Enqueuer {
            workflow: self.workflow.clone(),
            broker: self.broker.clone(),
            pending: self.topology.pending.clone(),
            sync: SyncClient::new(
                self.broker.clone(),
                self.topology.sync_to_master.clone(),
                self.topology.sync_ack_enq.clone(),
                self.config.sync_ack_timeout(),
                self.config.sync_max_attempts,
            ),
            terminate: self.terminate.clone(),
        };
        self.enqueuer_handle = Some(tokio::spawn(enqueuer.run()));

        let dequeuer = Dequeuer {
            workflow: self.workflow.clone(),
            broker: self.broker.clone(),
            completed: self.topology.completed.clone(),
            pending: self.topology.pending.clone(),
            sync: SyncClient::new(
                self.broker.clone(),
                self.topology.sync_to_master.clone(),
                self.topology.sync_ack_deq.clone(),
                self.config.sync_ack_timeout(),
                self.config.sync_max_attempts,
            ),
            terminate: self.terminate.clone(),
            resubmit_cursor: AtomicUsize::new(0),
        };
        self.dequeuer_handle = Some(tokio::spawn(dequeuer.run()));

        let responder = HeartbeatResponder::new(
            self.broker.clone(),
            self.topology.hb_request_wfp.clone(),
            self.topology.hb_response_wfp.clone(),
            self.terminate.clone(),
        );
        self.heartbeat_handle = Some(responder.spawn());
    }

    /// Check whether both workers are still running
    pub fn is_alive(&self) -> bool {
        let enq = self.enqueuer_handle.as_ref().is_some_and(|h| !h.is_finished());
        let deq = self.dequeuer_handle.as_ref().is_some_and(|h| !h.is_finished());
        enq && deq
    }

    /// Check whether any pipeline of this replica still lacks its
    /// completion signal
    pub fn workflow_incomplete(&self) -> bool {
        !self.workflow.all_completed()
    }

    /// Graceful stop: trip the terminate event and join all workers
    pub async fn stop(&mut self) {
        self.terminate.set();
        for handle in [
            self.enqueuer_handle.take(),
            self.dequeuer_handle.take(),
            self.heartbeat_handle.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = handle.await;
        }
    }

    /// Abort without draining; stands in for a worker crash
    pub fn kill(&mut self) {
        warn!("killing workflow processor");
        for handle in [
            self.enqueuer_handle.take(),
            self.dequeuer_handle.take(),
            self.heartbeat_handle.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}
