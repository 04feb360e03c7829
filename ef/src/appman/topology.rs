//! Queue topology parameterized by session id
//!
//! Every queue name is prefixed with the session id so concurrent engine
//! instances sharing one broker never collide.

/// The named queues one session uses
#[derive(Debug, Clone)]
pub struct QueueTopology {
    sid: String,

    /// Serialized task batches awaiting submission (enqueuer -> task manager)
    pub pending: Vec<String>,

    /// Serialized terminal tasks (task manager -> dequeuer)
    pub completed: Vec<String>,

    /// State-change proposals (all workers -> synchronizer)
    pub sync_to_master: String,

    /// Per-worker ack queues (synchronizer -> worker)
    pub sync_ack_enq: String,
    pub sync_ack_deq: String,
    pub sync_ack_tmgr: String,

    /// Heartbeat probe/response pairs, one per supervised worker
    pub hb_request_tmgr: String,
    pub hb_response_tmgr: String,
    pub hb_request_wfp: String,
    pub hb_response_wfp: String,
}

impl QueueTopology {
    /// Derive the topology for a session
    pub fn new(sid: &str, pending_queues: usize, completed_queues: usize) -> Self {
        let pending = (1..=pending_queues.max(1))
            .map(|i| format!("{sid}.pending-{i}"))
            .collect();
        let completed = (1..=completed_queues.max(1))
            .map(|i| format!("{sid}.completed-{i}"))
            .collect();

        Self {
            sid: sid.to_string(),
            pending,
            completed,
            sync_to_master: format!("{sid}.sync-to-master"),
            sync_ack_enq: format!("{sid}.sync-ack-enq"),
            sync_ack_deq: format!("{sid}.sync-ack-deq"),
            sync_ack_tmgr: format!("{sid}.sync-ack-tmgr"),
            hb_request_tmgr: format!("{sid}.hb-request-tmgr"),
            hb_response_tmgr: format!("{sid}.hb-response-tmgr"),
            hb_request_wfp: format!("{sid}.hb-request-wfp"),
            hb_response_wfp: format!("{sid}.hb-response-wfp"),
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Every queue of the session, for declaration and teardown
    pub fn all(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::with_capacity(self.pending.len() + self.completed.len() + 8);
        names.extend(self.pending.iter().map(String::as_str));
        names.extend(self.completed.iter().map(String::as_str));
        names.push(&self.sync_to_master);
        names.push(&self.sync_ack_enq);
        names.push(&self.sync_ack_deq);
        names.push(&self.sync_ack_tmgr);
        names.push(&self.hb_request_tmgr);
        names.push(&self.hb_response_tmgr);
        names.push(&self.hb_request_wfp);
        names.push(&self.hb_response_wfp);
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_names_are_sid_prefixed() {
        let topology = QueueTopology::new("session.abc", 2, 3);
        assert_eq!(topology.pending, vec!["session.abc.pending-1", "session.abc.pending-2"]);
        assert_eq!(topology.completed.len(), 3);
        for name in topology.all() {
            assert!(name.starts_with("session.abc."), "{name}");
        }
    }

    #[test]
    fn test_distinct_sessions_never_collide() {
        let a = QueueTopology::new("session.a", 1, 1);
        let b = QueueTopology::new("session.b", 1, 1);

        let a_names: HashSet<&str> = a.all().into_iter().collect();
        assert!(b.all().iter().all(|name| !a_names.contains(name)));
    }

    #[test]
    fn test_zero_queue_counts_are_clamped() {
        let topology = QueueTopology::new("s", 0, 0);
        assert_eq!(topology.pending.len(), 1);
        assert_eq!(topology.completed.len(), 1);
    }

    #[test]
    fn test_all_lists_every_queue() {
        let topology = QueueTopology::new("s", 1, 1);
        let names = topology.all();
        assert_eq!(names.len(), 10);
        assert!(names.contains(&"s.sync-to-master"));
        assert!(names.contains(&"s.hb-request-wfp"));
    }
}
