//! Worker lifecycle primitives
//!
//! Supervised workers expose exactly two control surfaces: a start primitive
//! and a terminate event. Everything else flows through broker queues.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Cooperative termination signal shared with worker tasks
///
/// Workers poll [`TerminateEvent::is_set`] between broker operations and may
/// park on [`TerminateEvent::wait`] inside a `select!`.
#[derive(Debug, Default)]
pub struct TerminateEvent {
    flag: AtomicBool,
    notify: Notify,
}

impl TerminateEvent {
    /// Create a fresh, unset event
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Trip the event, waking every parked waiter
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Check whether the event has been tripped
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Park until the event trips
    pub async fn wait(&self) {
        loop {
            if self.is_set() {
                return;
            }
            self.notify.notified().await;
        }
    }
}
