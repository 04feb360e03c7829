//! Task manager implementation

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use relayq::{Broker, Delivery, Properties};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::appman::QueueTopology;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::heartbeat::HeartbeatResponder;
use crate::rts::{Rts, RtsUpdate};
use crate::states::State;
use crate::sync::SyncClient;
use crate::worker::TerminateEvent;
use crate::workflow::Task;

const GET_POLL: Duration = Duration::from_millis(200);

/// Shared context for the main loop and its batch tasks
struct TmgrCtx {
    broker: Arc<Broker>,
    rts: Arc<dyn Rts>,
    pending: Vec<String>,
    completed: Vec<String>,
    sync: SyncClient,
    completed_cursor: AtomicUsize,
    terminate: Arc<TerminateEvent>,
}

impl TmgrCtx {
    /// Round-robin pick of a completed queue
    fn next_completed(&self) -> &str {
        let idx = self.completed_cursor.fetch_add(1, Ordering::Relaxed) % self.completed.len();
        &self.completed[idx]
    }
}

/// The task manager worker
pub struct TaskManager {
    ctx: Arc<TmgrCtx>,
    hb_request: String,
    hb_response: String,
    terminate: Arc<TerminateEvent>,
    main_handle: Option<JoinHandle<()>>,
    heartbeat_handle: Option<JoinHandle<()>>,
}

impl TaskManager {
    pub fn new(
        broker: Arc<Broker>,
        rts: Arc<dyn Rts>,
        topology: &QueueTopology,
        config: &EngineConfig,
    ) -> Self {
        let terminate = TerminateEvent::new();
        let sync = SyncClient::new(
            broker.clone(),
            topology.sync_to_master.clone(),
            topology.sync_ack_tmgr.clone(),
            config.sync_ack_timeout(),
            config.sync_max_attempts,
        );

        Self {
            ctx: Arc::new(TmgrCtx {
                broker,
                rts,
                pending: topology.pending.clone(),
                completed: topology.completed.clone(),
                sync,
                completed_cursor: AtomicUsize::new(0),
                terminate: terminate.clone(),
            }),
            hb_request: topology.hb_request_tmgr.clone(),
            hb_response: topology.hb_response_tmgr.clone(),
            terminate,
            main_handle: None,
            heartbeat_handle: None,
        }
    }

    /// Spawn the main loop
    pub fn start_manager(&mut self) {
        if self.main_handle.is_some() {
            warn!("task manager already started");
            return;
        }
        self.main_handle = Some(tokio::spawn(main_loop(self.ctx.clone())));
    }

    /// Spawn the heartbeat responder
    pub fn start_heartbeat(&mut self) {
        if self.heartbeat_handle.is_some() {
            return;
        }
        let responder = HeartbeatResponder::new(
            self.ctx.broker.clone(),
            self.hb_request.clone(),
            self.hb_response.clone(),
            self.terminate.clone(),
        );
        self.heartbeat_handle = Some(responder.spawn());
    }

    /// Check whether the main loop is still running
    pub fn is_alive(&self) -> bool {
        self.main_handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Check whether the heartbeat responder is still running
    pub fn heartbeat_alive(&self) -> bool {
        self.heartbeat_handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Graceful stop: trip the terminate event and join both tasks
    pub async fn stop(&mut self) {
        self.terminate.set();
        if let Some(handle) = self.main_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.heartbeat_handle.take() {
            let _ = handle.await;
        }
    }

    /// Abort without draining, abandoning in-flight batches
    ///
    /// Stands in for a worker crash; unacked pending deliveries stay leased
    /// until the supervisor recovers the queues for a respawn.
    pub fn kill(&mut self) {
        warn!("killing task manager");
        if let Some(handle) = self.main_handle.take() {
            handle.abort();
        }
        if let Some(handle) = self.heartbeat_handle.take() {
            handle.abort();
        }
    }
}

/// Round-robin over the pending queues, one batch task per delivery
async fn main_loop(ctx: Arc<TmgrCtx>) {
    info!(queues = ctx.pending.len(), "task manager started");

    let mut batches = tokio::task::JoinSet::new();
    let mut cursor = 0usize;

    while !ctx.terminate.is_set() {
        while let Some(result) = batches.try_join_next() {
            if let Err(err) = result
                && !err.is_cancelled()
            {
                error!(error = %err, "batch task panicked");
            }
        }

        let queue = ctx.pending[cursor % ctx.pending.len()].clone();
        cursor += 1;

        match ctx.broker.get_timeout(&queue, GET_POLL).await {
            Ok(Some(delivery)) => {
                let ctx = ctx.clone();
                batches.spawn(async move { process_batch(ctx, queue, delivery).await });
            }
            Ok(None) => {}
            Err(err) => {
                warn!(error = %err, queue, "pending queue fetch failed");
                tokio::time::sleep(GET_POLL).await;
            }
        }
    }

    // Drain gracefully; batch tasks observe the terminate event themselves
    while batches.join_next().await.is_some() {}
    info!("task manager stopped");
}

/// Submit one batch and see it through to terminal states
///
/// The pending delivery is acked only after every task of the batch is
/// terminal, so a crash anywhere in between leaves the whole batch leased
/// and a respawned manager re-runs it. Re-applied transitions are no-ops at
/// the synchronizer.
async fn process_batch(ctx: Arc<TmgrCtx>, queue: String, delivery: Delivery) {
    let batch: Vec<Task> = match serde_json::from_slice(&delivery.body) {
        Ok(batch) => batch,
        Err(err) => {
            error!(error = %err, queue, "dropping undecodable batch");
            let _ = ctx.broker.ack(&queue, delivery.delivery_tag).await;
            return;
        }
    };
    debug!(
        count = batch.len(),
        queue,
        redelivered = delivery.redelivered,
        "received task batch"
    );

    let mut watchers = Vec::with_capacity(batch.len());
    for mut task in batch {
        if ctx.terminate.is_set() {
            return;
        }
        match ctx.rts.submit(&task).await {
            Ok(updates) => {
                task.attempts += 1;
                task.set_state(State::Submitted);
                if let Err(err) = ctx.sync.task(&task).await {
                    error!(uid = %task.uid, error = %err, "failed to sync submission");
                    return;
                }
                watchers.push(watch_task(ctx.clone(), task, updates));
            }
            Err(err) => {
                warn!(uid = %task.uid, error = %err, "runtime system rejected task");
                task.set_state(State::Failed);
                if ctx.sync.task(&task).await.is_err() {
                    return;
                }
                if let Err(err) = publish_completed(&ctx, &task).await {
                    error!(uid = %task.uid, error = %err, "failed to publish rejected task");
                    return;
                }
            }
        }
    }

    futures::future::join_all(watchers).await;

    if !ctx.terminate.is_set() {
        let _ = ctx.broker.ack(&queue, delivery.delivery_tag).await;
    }
}

/// Forward runtime-system transitions for one task until it settles
async fn watch_task(ctx: Arc<TmgrCtx>, mut task: Task, mut updates: mpsc::Receiver<RtsUpdate>) {
    loop {
        tokio::select! {
            _ = ctx.terminate.wait() => return,
            update = updates.recv() => {
                let Some(update) = update else {
                    warn!(uid = %task.uid, "runtime system closed the update stream");
                    return;
                };
                match update.state {
                    State::Running => {
                        task.path = update.path;
                        task.set_state(State::Running);
                        if ctx.sync.task(&task).await.is_err() {
                            return;
                        }
                    }
                    state @ (State::Done | State::Failed) => {
                        task.exit_code = update.exit_code;
                        if update.path.is_some() {
                            task.path = update.path;
                        }
                        task.set_state(state);
                        if ctx.sync.task(&task).await.is_err() {
                            return;
                        }
                        if let Err(err) = publish_completed(&ctx, &task).await {
                            error!(uid = %task.uid, error = %err, "failed to publish completed task");
                        }
                        return;
                    }
                    other => {
                        debug!(uid = %task.uid, state = %other, "ignoring runtime update");
                    }
                }
            }
        }
    }
}

/// Publish a terminal task onto a completed queue (round-robin)
async fn publish_completed(ctx: &TmgrCtx, task: &Task) -> Result<(), EngineError> {
    let queue = ctx.next_completed();
    let body = serde_json::to_vec(std::slice::from_ref(task))?;
    ctx.broker.publish(queue, body, Properties::default()).await?;
    debug!(uid = %task.uid, state = %task.state, queue, "published completed task");
    Ok(())
}
