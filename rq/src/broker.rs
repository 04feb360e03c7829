//! The relay: named queues with leased deliveries
//!
//! A `get` leases the next ready delivery; the lease is discharged by `ack`
//! and reinstated (at the front of the queue, flagged redelivered) by
//! `recover`. Deleting and redeclaring a queue purges it, which is how a
//! fresh session clears residue from prior runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace, warn};

use crate::error::BrokerError;
use crate::message::{Delivery, Properties};

struct QueueState {
    durable: bool,
    ready: VecDeque<Delivery>,
    unacked: HashMap<u64, Delivery>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn new(durable: bool) -> Self {
        Self {
            durable,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            notify: Arc::new(Notify::new()),
        }
    }
}

/// An in-process message relay with named queues
///
/// Cheap to share: wrap in an [`Arc`] and hand clones to every worker.
#[derive(Default)]
pub struct Broker {
    queues: Mutex<HashMap<String, QueueState>>,
    next_tag: AtomicU64,
}

impl Broker {
    /// Create an empty relay
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
        }
    }

    /// Declare a queue
    ///
    /// Redeclaring an existing queue keeps its content; use
    /// [`Broker::queue_delete`] first to start clean.
    pub async fn queue_declare(&self, queue: &str, durable: bool) {
        let mut queues = self.queues.lock().await;
        if queues.contains_key(queue) {
            trace!(queue, "queue already declared");
            return;
        }
        debug!(queue, durable, "declaring queue");
        queues.insert(queue.to_string(), QueueState::new(durable));
    }

    /// Delete a queue and everything on it
    ///
    /// Deleting an unknown queue is a no-op.
    pub async fn queue_delete(&self, queue: &str) {
        let mut queues = self.queues.lock().await;
        if queues.remove(queue).is_some() {
            debug!(queue, "deleted queue");
        }
    }

    /// Check whether a queue is declared
    pub async fn queue_exists(&self, queue: &str) -> bool {
        self.queues.lock().await.contains_key(queue)
    }

    /// Number of ready (not leased) deliveries on a queue
    pub async fn queue_len(&self, queue: &str) -> Result<usize, BrokerError> {
        let queues = self.queues.lock().await;
        let state = queues
            .get(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        Ok(state.ready.len())
    }

    /// Number of leased (unacked) deliveries on a queue
    pub async fn unacked_len(&self, queue: &str) -> Result<usize, BrokerError> {
        let queues = self.queues.lock().await;
        let state = queues
            .get(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        Ok(state.unacked.len())
    }

    /// Publish a message to a queue
    pub async fn publish(
        &self,
        queue: &str,
        body: impl Into<Vec<u8>>,
        properties: Properties,
    ) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;

        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        state.ready.push_back(Delivery {
            delivery_tag: tag,
            redelivered: false,
            properties,
            body: body.into(),
        });
        trace!(queue, tag, depth = state.ready.len(), "published");
        state.notify.notify_one();
        Ok(())
    }

    /// Lease the next ready delivery, if any
    pub async fn get(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        Ok(Self::lease(queue, state))
    }

    /// Lease the next delivery, waiting up to `timeout` for one to arrive
    ///
    /// Returns `Ok(None)` on timeout so callers can interleave termination
    /// checks between blocking gets.
    pub async fn get_timeout(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Delivery>, BrokerError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notify = {
                let mut queues = self.queues.lock().await;
                let state = queues
                    .get_mut(queue)
                    .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
                if let Some(delivery) = Self::lease(queue, state) {
                    return Ok(Some(delivery));
                }
                state.notify.clone()
            };

            let notified = notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Discharge a leased delivery
    pub async fn ack(&self, queue: &str, delivery_tag: u64) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        if state.unacked.remove(&delivery_tag).is_none() {
            return Err(BrokerError::UnknownDeliveryTag {
                queue: queue.to_string(),
                tag: delivery_tag,
            });
        }
        trace!(queue, delivery_tag, "acked");
        Ok(())
    }

    /// Return every leased delivery of a queue to the front of the line
    ///
    /// Used when a consumer died without acking: the next consumer sees the
    /// deliveries again, flagged `redelivered`, in original publish order.
    /// Returns how many deliveries were requeued.
    pub async fn recover(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;

        let mut leased: Vec<Delivery> = state.unacked.drain().map(|(_, d)| d).collect();
        let count = leased.len();
        if count == 0 {
            return Ok(0);
        }

        // Publish order is tag order
        leased.sort_by_key(|d| d.delivery_tag);
        for mut delivery in leased.into_iter().rev() {
            delivery.redelivered = true;
            state.ready.push_front(delivery);
        }
        warn!(queue, count, "recovered unacked deliveries");
        for _ in 0..count {
            state.notify.notify_one();
        }
        Ok(count)
    }

    /// Drop every ready delivery of a queue; leases are untouched
    pub async fn purge(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        let count = state.ready.len();
        state.ready.clear();
        debug!(queue, count, "purged");
        Ok(count)
    }

    /// Whether the queue was declared durable
    pub async fn is_durable(&self, queue: &str) -> Result<bool, BrokerError> {
        let queues = self.queues.lock().await;
        let state = queues
            .get(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        Ok(state.durable)
    }

    fn lease(queue: &str, state: &mut QueueState) -> Option<Delivery> {
        let delivery = state.ready.pop_front()?;
        state.unacked.insert(delivery.delivery_tag, delivery.clone());
        trace!(queue, tag = delivery.delivery_tag, "leased");
        Some(delivery)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_get_ack_roundtrip() {
        let broker = Broker::new();
        broker.queue_declare("q", true).await;

        broker.publish("q", b"one".to_vec(), Properties::default()).await.unwrap();
        broker.publish("q", b"two".to_vec(), Properties::default()).await.unwrap();

        let first = broker.get("q").await.unwrap().unwrap();
        assert_eq!(first.text(), "one");
        assert!(!first.redelivered);

        let second = broker.get("q").await.unwrap().unwrap();
        assert_eq!(second.text(), "two");

        assert_eq!(broker.queue_len("q").await.unwrap(), 0);
        assert_eq!(broker.unacked_len("q").await.unwrap(), 2);

        broker.ack("q", first.delivery_tag).await.unwrap();
        broker.ack("q", second.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_len("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_undeclared_queue_errors() {
        let broker = Broker::new();

        let err = broker
            .publish("missing", b"x".to_vec(), Properties::default())
            .await
            .unwrap_err();
        assert_eq!(err, BrokerError::QueueNotFound("missing".to_string()));

        assert!(broker.get("missing").await.is_err());
        assert!(broker.queue_len("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_ack_unknown_tag() {
        let broker = Broker::new();
        broker.queue_declare("q", false).await;

        let err = broker.ack("q", 42).await.unwrap_err();
        assert!(matches!(err, BrokerError::UnknownDeliveryTag { tag: 42, .. }));
    }

    #[tokio::test]
    async fn test_recover_redelivers_in_order() {
        let broker = Broker::new();
        broker.queue_declare("q", true).await;

        for body in ["a", "b", "c"] {
            broker.publish("q", body.as_bytes().to_vec(), Properties::default()).await.unwrap();
        }

        // Lease all three, ack only the middle one
        let a = broker.get("q").await.unwrap().unwrap();
        let b = broker.get("q").await.unwrap().unwrap();
        let c = broker.get("q").await.unwrap().unwrap();
        broker.ack("q", b.delivery_tag).await.unwrap();
        let _ = (a, c);

        let recovered = broker.recover("q").await.unwrap();
        assert_eq!(recovered, 2);

        let first = broker.get("q").await.unwrap().unwrap();
        let second = broker.get("q").await.unwrap().unwrap();
        assert_eq!(first.text(), "a");
        assert_eq!(second.text(), "c");
        assert!(first.redelivered);
        assert!(second.redelivered);
        assert!(broker.get("q").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_timeout_returns_none_when_empty() {
        let broker = Broker::new();
        broker.queue_declare("q", true).await;

        let got = broker.get_timeout("q", Duration::from_millis(50)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_get_timeout_wakes_on_publish() {
        let broker = Arc::new(Broker::new());
        broker.queue_declare("q", true).await;

        let consumer = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.get_timeout("q", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.publish("q", b"wake".to_vec(), Properties::default()).await.unwrap();

        let delivery = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.text(), "wake");
    }

    #[tokio::test]
    async fn test_delete_then_declare_purges() {
        let broker = Broker::new();
        broker.queue_declare("q", true).await;
        broker.publish("q", b"stale".to_vec(), Properties::default()).await.unwrap();

        broker.queue_delete("q").await;
        broker.queue_declare("q", true).await;
        assert_eq!(broker.queue_len("q").await.unwrap(), 0);

        // Messages produced after the redeclaration are not lost
        broker.publish("q", b"fresh".to_vec(), Properties::default()).await.unwrap();
        let delivery = broker.get("q").await.unwrap().unwrap();
        assert_eq!(delivery.text(), "fresh");
    }

    #[tokio::test]
    async fn test_redeclare_keeps_content() {
        let broker = Broker::new();
        broker.queue_declare("q", true).await;
        broker.publish("q", b"kept".to_vec(), Properties::default()).await.unwrap();

        broker.queue_declare("q", true).await;
        assert_eq!(broker.queue_len("q").await.unwrap(), 1);
        assert!(broker.is_durable("q").await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_leaves_leases() {
        let broker = Broker::new();
        broker.queue_declare("q", true).await;
        broker.publish("q", b"leased".to_vec(), Properties::default()).await.unwrap();
        broker.publish("q", b"ready".to_vec(), Properties::default()).await.unwrap();

        let leased = broker.get("q").await.unwrap().unwrap();
        assert_eq!(broker.purge("q").await.unwrap(), 1);
        assert_eq!(broker.unacked_len("q").await.unwrap(), 1);
        broker.ack("q", leased.delivery_tag).await.unwrap();
    }
}
