//! Engine configuration types and environment loading

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Broker hostname variable
pub const ENV_BROKER_HOSTNAME: &str = "RMQ_HOSTNAME";
/// Broker port variable
pub const ENV_BROKER_PORT: &str = "RMQ_PORT";
/// Heartbeat interval variable (seconds)
pub const ENV_HB_INTERVAL: &str = "ENTK_HB_INTERVAL";
/// Supervision throttle variable (any non-empty value enables 1s passes)
pub const ENV_SLOW_RUN: &str = "RADICAL_ENTK_SLOW";

/// Engine-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Broker host
    pub hostname: String,

    /// Broker port
    pub port: u16,

    /// Number of pending-* queues between enqueuer and task manager
    #[serde(rename = "pending-queues")]
    pub pending_queues: usize,

    /// Number of completed-* queues between task manager and dequeuer
    #[serde(rename = "completed-queues")]
    pub completed_queues: usize,

    /// Heartbeat probe interval in seconds
    #[serde(rename = "heartbeat-interval-secs")]
    pub heartbeat_interval_secs: u64,

    /// Consecutive missed heartbeats before a worker is declared dead
    #[serde(rename = "heartbeat-max-misses")]
    pub heartbeat_max_misses: u32,

    /// Throttle supervision passes to one per second
    #[serde(rename = "slow-run")]
    pub slow_run: bool,

    /// How long a proposer waits for a synchronizer ack before resubmitting
    #[serde(rename = "sync-ack-timeout-ms")]
    pub sync_ack_timeout_ms: u64,

    /// Resubmissions before an unacked proposal is surfaced as an error
    #[serde(rename = "sync-max-attempts")]
    pub sync_max_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 5672,
            pending_queues: 1,
            completed_queues: 1,
            heartbeat_interval_secs: 5,
            heartbeat_max_misses: 3,
            slow_run: false,
            sync_ack_timeout_ms: 1_000,
            sync_max_attempts: 10,
        }
    }
}

impl EngineConfig {
    /// Build a configuration from the recognized environment variables,
    /// falling back to defaults for anything unset or unparsable
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(hostname) = std::env::var(ENV_BROKER_HOSTNAME)
            && !hostname.is_empty()
        {
            config.hostname = hostname;
        }

        if let Ok(port) = std::env::var(ENV_BROKER_PORT) {
            match port.parse() {
                Ok(port) => config.port = port,
                Err(_) => tracing::warn!(%port, "ignoring unparsable {}", ENV_BROKER_PORT),
            }
        }

        if let Ok(interval) = std::env::var(ENV_HB_INTERVAL) {
            match interval.parse() {
                Ok(secs) if secs > 0 => config.heartbeat_interval_secs = secs,
                _ => tracing::warn!(%interval, "ignoring unparsable {}", ENV_HB_INTERVAL),
            }
        }

        config.slow_run = std::env::var(ENV_SLOW_RUN).map(|v| !v.is_empty()).unwrap_or(false);

        config
    }

    /// Heartbeat probe interval
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Synchronizer ack wait per attempt
    pub fn sync_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_ack_timeout_ms)
    }

    /// Supervision pass cadence
    pub fn supervision_cadence(&self) -> Duration {
        if self.slow_run {
            Duration::from_secs(1)
        } else {
            Duration::from_millis(100)
        }
    }
}
