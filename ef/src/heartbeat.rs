//! Heartbeat probe/response between supervisor and workers
//!
//! The application manager publishes a probe on a worker's request queue and
//! waits one interval for the correlated response. Workers run a responder
//! that echoes every probe. Consecutive misses mark the worker dead, which
//! triggers a respawn.

use std::sync::Arc;
use std::time::Duration;

use relayq::{Broker, Properties};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::worker::TerminateEvent;

const RESPONDER_POLL: Duration = Duration::from_millis(200);

/// Worker-side probe echo loop
pub struct HeartbeatResponder {
    broker: Arc<Broker>,
    request_queue: String,
    response_queue: String,
    terminate: Arc<TerminateEvent>,
}

impl HeartbeatResponder {
    pub fn new(
        broker: Arc<Broker>,
        request_queue: impl Into<String>,
        response_queue: impl Into<String>,
        terminate: Arc<TerminateEvent>,
    ) -> Self {
        Self {
            broker,
            request_queue: request_queue.into(),
            response_queue: response_queue.into(),
            terminate,
        }
    }

    /// Echo probes until the terminate event trips
    pub async fn run(self) {
        info!(queue = %self.request_queue, "heartbeat responder started");

        while !self.terminate.is_set() {
            match self.broker.get_timeout(&self.request_queue, RESPONDER_POLL).await {
                Ok(Some(delivery)) => {
                    let correlation_id = delivery
                        .properties
                        .correlation_id
                        .clone()
                        .unwrap_or_default();
                    debug!(queue = %self.request_queue, %correlation_id, "answering heartbeat");
                    if let Err(err) = self
                        .broker
                        .publish(
                            &self.response_queue,
                            delivery.body.clone(),
                            Properties::reply(correlation_id),
                        )
                        .await
                    {
                        warn!(error = %err, "failed to answer heartbeat");
                    }
                    let _ = self.broker.ack(&self.request_queue, delivery.delivery_tag).await;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "heartbeat request fetch failed");
                    tokio::time::sleep(RESPONDER_POLL).await;
                }
            }
        }

        info!(queue = %self.request_queue, "heartbeat responder stopped");
    }

    /// Spawn the responder as a task
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

/// Supervisor-side probe state for one worker
pub struct HeartbeatMonitor {
    broker: Arc<Broker>,
    request_queue: String,
    response_queue: String,
    interval: Duration,
    max_misses: u32,
    misses: u32,
}

impl HeartbeatMonitor {
    pub fn new(
        broker: Arc<Broker>,
        request_queue: impl Into<String>,
        response_queue: impl Into<String>,
        interval: Duration,
        max_misses: u32,
    ) -> Self {
        Self {
            broker,
            request_queue: request_queue.into(),
            response_queue: response_queue.into(),
            interval,
            max_misses: max_misses.max(1),
            misses: 0,
        }
    }

    /// One probe round; waits up to the interval for the correlated response
    pub async fn probe(&mut self) -> Result<bool, EngineError> {
        let correlation_id = Uuid::now_v7().to_string();
        self.broker
            .publish(
                &self.request_queue,
                b"heartbeat".to_vec(),
                Properties::request(self.response_queue.as_str(), correlation_id.as_str()),
            )
            .await?;

        let deadline = tokio::time::Instant::now() + self.interval;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.broker.get_timeout(&self.response_queue, remaining).await? {
                Some(delivery) => {
                    self.broker
                        .ack(&self.response_queue, delivery.delivery_tag)
                        .await?;
                    if delivery.properties.correlates_with(&correlation_id) {
                        self.misses = 0;
                        return Ok(true);
                    }
                    // A late answer to an earlier probe
                    debug!(queue = %self.response_queue, "discarding stale heartbeat response");
                }
                None => break,
            }
        }

        self.misses += 1;
        warn!(
            queue = %self.request_queue,
            misses = self.misses,
            "heartbeat response missed"
        );
        Ok(false)
    }

    /// Check whether the miss budget is exhausted
    pub fn is_dead(&self) -> bool {
        self.misses >= self.max_misses
    }

    /// Forget accumulated misses (after a respawn)
    pub fn reset(&mut self) {
        self.misses = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn hb_broker() -> Arc<Broker> {
        let broker = Arc::new(Broker::new());
        broker.queue_declare("hb-request", true).await;
        broker.queue_declare("hb-response", true).await;
        broker
    }

    #[tokio::test]
    async fn test_probe_answered() {
        let broker = hb_broker().await;
        let terminate = TerminateEvent::new();
        HeartbeatResponder::new(broker.clone(), "hb-request", "hb-response", terminate.clone())
            .spawn();

        let mut monitor = HeartbeatMonitor::new(
            broker,
            "hb-request",
            "hb-response",
            Duration::from_secs(2),
            3,
        );
        assert!(monitor.probe().await.unwrap());
        assert!(!monitor.is_dead());

        terminate.set();
    }

    #[tokio::test]
    async fn test_misses_accumulate_to_dead() {
        let broker = hb_broker().await;
        let mut monitor = HeartbeatMonitor::new(
            broker,
            "hb-request",
            "hb-response",
            Duration::from_millis(20),
            3,
        );

        for _ in 0..3 {
            assert!(!monitor.probe().await.unwrap());
        }
        assert!(monitor.is_dead());

        monitor.reset();
        assert!(!monitor.is_dead());
    }

    #[tokio::test]
    async fn test_responder_stops_on_terminate() {
        let broker = hb_broker().await;
        let terminate = TerminateEvent::new();
        let handle =
            HeartbeatResponder::new(broker, "hb-request", "hb-response", terminate.clone()).spawn();

        terminate.set();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("responder should exit")
            .unwrap();
    }
}
