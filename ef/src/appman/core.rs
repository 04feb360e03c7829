//! Application manager implementation

use std::sync::Arc;

use relayq::Broker;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::heartbeat::HeartbeatMonitor;
use crate::rm::ResourceManager;
use crate::rts::{LocalRts, Rts};
use crate::tmgr::TaskManager;
use crate::wfp::WfProcessor;
use crate::worker::TerminateEvent;
use crate::workflow::{Pipeline, Workflow, generate_uid};

use super::synchronizer::Synchronizer;
use super::topology::QueueTopology;

/// Handle on a running synchronizer task
struct SyncWorker {
    terminate: Arc<TerminateEvent>,
    handle: JoinHandle<()>,
}

/// The process-wide orchestrator
///
/// Owns the authoritative workflow replica and the broker, spawns the
/// synchronizer, workflow processor and task manager, and supervises them
/// until every pipeline signals completion.
pub struct AppManager {
    uid: String,
    sid: String,
    config: EngineConfig,
    broker: Arc<Broker>,
    topology: QueueTopology,
    workflow: Option<Workflow>,
    resource_manager: Option<Box<dyn ResourceManager>>,
    rts: Arc<dyn Rts>,
}

impl AppManager {
    /// Construct a manager with a fresh session id
    pub fn new(config: EngineConfig) -> Self {
        let uid = generate_uid("appmanager");
        let sid = generate_uid("session");
        let topology = QueueTopology::new(&sid, config.pending_queues, config.completed_queues);
        let sandbox = std::env::temp_dir().join("ensembleflow").join(&sid);

        info!(
            uid = %uid,
            sid = %sid,
            broker = format!("{}:{}", config.hostname, config.port),
            "application manager initialized"
        );

        Self {
            uid,
            sid,
            config,
            broker: Arc::new(Broker::new()),
            topology,
            workflow: None,
            resource_manager: None,
            rts: Arc::new(LocalRts::new(sandbox)),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    /// The session broker, exposed for diagnostics
    pub fn broker(&self) -> Arc<Broker> {
        self.broker.clone()
    }

    /// The authoritative workflow replica, once assigned
    pub fn workflow(&self) -> Option<&Workflow> {
        self.workflow.as_ref()
    }

    /// Replace the runtime system (defaults to a local sandbox)
    pub fn set_rts(&mut self, rts: Arc<dyn Rts>) {
        self.rts = rts;
    }

    /// Wire the resource manager the run will reserve through
    pub fn assign_resource_manager(&mut self, resource_manager: Box<dyn ResourceManager>) {
        self.resource_manager = Some(resource_manager);
    }

    /// Validate and store the workflow; a single pipeline or any collection
    /// of pipelines is accepted
    pub fn assign_workflow(
        &mut self,
        pipelines: impl IntoIterator<Item = Pipeline>,
    ) -> Result<(), EngineError> {
        let pipelines: Vec<Pipeline> = pipelines.into_iter().collect();
        if pipelines.is_empty() {
            return Err(EngineError::missing(&self.uid, "workflow"));
        }
        for pipeline in &pipelines {
            pipeline.validate()?;
        }

        info!(pipelines = pipelines.len(), "workflow assigned");
        self.workflow = Some(Workflow::new(pipelines));
        Ok(())
    }

    /// Drive the workflow to completion
    ///
    /// Declares the queue topology, submits the resource reservation, starts
    /// the synchronizer, workflow processor and task manager, then supervises
    /// until every pipeline signals completion. Shutdown is ordered: workflow
    /// processor, task manager, synchronizer, reservation — on success,
    /// failure and interrupt alike.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        let workflow = self
            .workflow
            .clone()
            .ok_or_else(|| EngineError::missing(&self.uid, "workflow"))?;
        if self.resource_manager.is_none() {
            return Err(EngineError::missing(&self.uid, "resource_manager"));
        }

        self.setup_queues().await;

        {
            let rm = self.resource_manager.as_mut().expect("checked above");
            rm.validate()?;
            rm.populate()?;
            info!("submitting resource reservation");
            rm.submit_reservation().await?;
        }

        info!("starting synchronizer");
        let mut sync_worker = self.spawn_synchronizer(&workflow);

        info!("starting workflow processor");
        let mut wfp = self.build_wfp(&workflow).await;
        wfp.start_processor();

        info!("starting task manager");
        let mut tmgr = self.build_tmgr();
        tmgr.start_manager();
        tmgr.start_heartbeat();

        let mut tmgr_monitor = HeartbeatMonitor::new(
            self.broker.clone(),
            self.topology.hb_request_tmgr.clone(),
            self.topology.hb_response_tmgr.clone(),
            self.config.heartbeat_interval(),
            self.config.heartbeat_max_misses,
        );
        let mut wfp_monitor = HeartbeatMonitor::new(
            self.broker.clone(),
            self.topology.hb_request_wfp.clone(),
            self.topology.hb_response_wfp.clone(),
            self.config.heartbeat_interval(),
            self.config.heartbeat_max_misses,
        );

        let result = self
            .supervise(
                &workflow,
                &mut sync_worker,
                &mut wfp,
                &mut tmgr,
                &mut tmgr_monitor,
                &mut wfp_monitor,
            )
            .await;

        info!("terminating workflow processor");
        wfp.stop().await;
        info!("terminating task manager");
        tmgr.stop().await;
        info!("terminating synchronizer");
        sync_worker.terminate.set();
        let _ = sync_worker.handle.await;

        if let Some(rm) = self.resource_manager.as_mut() {
            if let Err(err) = rm.cancel_reservation().await {
                warn!(error = %err, "failed to cancel resource reservation");
            }
        }

        result
    }

    /// Delete-then-declare every session queue, purging residue from prior
    /// runs while keeping the queues durable
    async fn setup_queues(&self) {
        for queue in self.topology.all() {
            self.broker.queue_delete(queue).await;
            self.broker.queue_declare(queue, true).await;
        }
        debug!(queues = self.topology.all().len(), "queue topology ready");
    }

    fn spawn_synchronizer(&self, workflow: &Workflow) -> SyncWorker {
        let terminate = TerminateEvent::new();
        let synchronizer = Synchronizer::new(
            workflow.clone(),
            self.broker.clone(),
            self.topology.sync_to_master.clone(),
            terminate.clone(),
        );
        SyncWorker {
            terminate,
            handle: tokio::spawn(synchronizer.run()),
        }
    }

    async fn build_wfp(&self, workflow: &Workflow) -> WfProcessor {
        let replica = workflow.deep_copy().await;
        WfProcessor::new(replica, self.broker.clone(), self.topology.clone(), &self.config)
    }

    fn build_tmgr(&self) -> TaskManager {
        TaskManager::new(
            self.broker.clone(),
            self.rts.clone(),
            &self.topology,
            &self.config,
        )
    }

    /// Requeue deliveries the dead workflow processor left leased
    async fn recover_wfp_queues(&self) {
        for queue in self
            .topology
            .completed
            .iter()
            .chain([&self.topology.sync_ack_enq, &self.topology.sync_ack_deq])
        {
            let _ = self.broker.recover(queue).await;
        }
    }

    /// Requeue deliveries the dead task manager left leased
    async fn recover_tmgr_queues(&self) {
        for queue in self.topology.pending.iter().chain([&self.topology.sync_ack_tmgr]) {
            let _ = self.broker.recover(queue).await;
        }
    }

    /// The supervision loop
    ///
    /// Each pass: completion check, synchronizer liveness, workflow processor
    /// liveness + heartbeat, task manager liveness + heartbeat, then a
    /// cadence sleep that doubles as the Ctrl-C suspension point.
    async fn supervise(
        &self,
        workflow: &Workflow,
        sync_worker: &mut SyncWorker,
        wfp: &mut WfProcessor,
        tmgr: &mut TaskManager,
        tmgr_monitor: &mut HeartbeatMonitor,
        wfp_monitor: &mut HeartbeatMonitor,
    ) -> Result<(), EngineError> {
        let cadence = self.config.supervision_cadence();
        let heartbeat_interval = self.config.heartbeat_interval();
        let mut next_probe = tokio::time::Instant::now() + heartbeat_interval;

        let (interrupt_tx, interrupt_rx) = oneshot::channel();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = interrupt_tx.send(());
            }
        });
        let mut interrupt = Some(interrupt_rx);

        loop {
            if workflow.all_completed() && !wfp.workflow_incomplete() {
                info!("all pipelines completed");
                return Ok(());
            }

            if sync_worker.handle.is_finished() {
                warn!("synchronizer died, restarting");
                *sync_worker = self.spawn_synchronizer(workflow);
            }

            if !wfp.is_alive() || wfp_monitor.is_dead() {
                warn!("workflow processor lost, restarting");
                wfp.kill();
                self.recover_wfp_queues().await;
                *wfp = self.build_wfp(workflow).await;
                wfp.start_processor();
                wfp_monitor.reset();
            }

            if !tmgr.is_alive() || tmgr_monitor.is_dead() {
                warn!("task manager lost, restarting");
                tmgr.kill();
                self.recover_tmgr_queues().await;
                *tmgr = self.build_tmgr();
                tmgr.start_manager();
                tmgr.start_heartbeat();
                tmgr_monitor.reset();
            }

            if tokio::time::Instant::now() >= next_probe {
                let _ = tmgr_monitor.probe().await;
                let _ = wfp_monitor.probe().await;
                next_probe = tokio::time::Instant::now() + heartbeat_interval;
            }

            if let Some(rx) = interrupt.as_mut() {
                tokio::select! {
                    received = rx => {
                        interrupt = None;
                        if received.is_ok() {
                            error!("execution interrupted by user, shutting down");
                            return Err(EngineError::Interrupted);
                        }
                    }
                    _ = tokio::time::sleep(cadence) => {}
                }
            } else {
                tokio::time::sleep(cadence).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::State;
    use crate::workflow::{Stage, Task};
    use std::time::Duration;
    use tempfile::tempdir;

    fn echo_pipeline(arg: &str) -> Pipeline {
        let mut pipeline = Pipeline::new();
        let mut stage = Stage::new();
        stage.add_task(Task::new().with_executable("/bin/echo").with_arguments([arg]));
        pipeline.add_stage(stage);
        pipeline
    }

    #[test]
    fn test_assign_workflow_validation() {
        let mut amgr = AppManager::new(EngineConfig::default());

        let err = amgr.assign_workflow([]).unwrap_err();
        assert!(matches!(err, EngineError::Missing { .. }));

        // Pipeline of zero stages
        let err = amgr.assign_workflow([Pipeline::new()]).unwrap_err();
        assert!(matches!(err, EngineError::Missing { .. }));

        // Stage without tasks
        let mut pipeline = Pipeline::new();
        pipeline.add_stage(Stage::new());
        assert!(amgr.assign_workflow([pipeline]).is_err());

        // Task without executable
        let mut pipeline = Pipeline::new();
        let mut stage = Stage::new();
        stage.add_task(Task::new());
        pipeline.add_stage(stage);
        assert!(amgr.assign_workflow([pipeline]).is_err());

        assert!(amgr.assign_workflow([echo_pipeline("ok")]).is_ok());
    }

    #[tokio::test]
    async fn test_run_requires_workflow_and_rm() {
        let mut amgr = AppManager::new(EngineConfig::default());
        let err = amgr.run().await.unwrap_err();
        assert!(matches!(err, EngineError::Missing { ref attribute, .. } if attribute == "workflow"));

        amgr.assign_workflow([echo_pipeline("x")]).unwrap();
        let err = amgr.run().await.unwrap_err();
        assert!(
            matches!(err, EngineError::Missing { ref attribute, .. } if attribute == "resource_manager")
        );
    }

    #[test]
    fn test_distinct_sessions_get_distinct_queues() {
        let a = AppManager::new(EngineConfig::default());
        let b = AppManager::new(EngineConfig::default());
        assert_ne!(a.sid(), b.sid());

        let a_names: Vec<&str> = a.topology().all();
        assert!(b.topology().all().iter().all(|name| !a_names.contains(name)));
    }

    /// Kill the task manager mid-run and let a respawn finish the batch:
    /// every terminal transition must land on the tree exactly once.
    #[tokio::test]
    async fn test_task_manager_respawn_applies_transitions_once() {
        let sandbox = tempdir().unwrap();
        let config = EngineConfig {
            sync_ack_timeout_ms: 200,
            sync_max_attempts: 50,
            ..Default::default()
        };

        let mut amgr = AppManager::new(config);
        amgr.set_rts(Arc::new(LocalRts::new(sandbox.path())));

        // A task slow enough that the kill lands while it is in flight
        let mut pipeline = Pipeline::new();
        let mut stage = Stage::new();
        stage.add_task(Task::new().with_executable("/bin/sleep").with_arguments(["1"]));
        pipeline.add_stage(stage);
        amgr.assign_workflow([pipeline]).unwrap();

        let workflow = amgr.workflow().unwrap().clone();
        let broker = amgr.broker();
        amgr.setup_queues().await;

        let sync_worker = amgr.spawn_synchronizer(&workflow);
        let mut wfp = amgr.build_wfp(&workflow).await;
        wfp.start_processor();

        // First task manager leases the batch and dies before the task
        // settles; the delivery stays leased on the pending queue
        let mut tmgr = amgr.build_tmgr();
        tmgr.start_manager();

        // Wait until the batch has been leased off the pending queue
        let pending = amgr.topology().pending[0].clone();
        for _ in 0..100 {
            if broker.unacked_len(&pending).await.unwrap() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(broker.unacked_len(&pending).await.unwrap() > 0, "batch should be leased");

        tmgr.kill();
        amgr.recover_tmgr_queues().await;

        // Fresh task manager picks the redelivered batch up
        let mut tmgr = amgr.build_tmgr();
        tmgr.start_manager();

        tokio::time::timeout(Duration::from_secs(15), workflow.pipelines()[0].wait_completed())
            .await
            .expect("workflow should complete after respawn");

        // Exactly one DONE transition applied to the authoritative replica
        let body = workflow.pipelines()[0].lock().await;
        let task = &body.stages[0].tasks[0];
        assert_eq!(task.state, State::Done);
        let done_count = task
            .state_history
            .iter()
            .filter(|s| **s == State::Done)
            .count();
        assert_eq!(done_count, 1);
        drop(body);

        wfp.stop().await;
        tmgr.stop().await;
        sync_worker.terminate.set();
        let _ = sync_worker.handle.await;
    }
}
