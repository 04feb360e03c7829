//! Broker error types

use thiserror::Error;

/// Errors surfaced by relay operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("queue '{0}' is not declared")]
    QueueNotFound(String),

    #[error("delivery tag {tag} is not leased on queue '{queue}'")]
    UnknownDeliveryTag { queue: String, tag: u64 },
}

impl BrokerError {
    /// Check whether the error indicates a missing queue
    pub fn is_missing_queue(&self) -> bool {
        matches!(self, BrokerError::QueueNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_missing_queue() {
        assert!(BrokerError::QueueNotFound("q".to_string()).is_missing_queue());
        assert!(
            !BrokerError::UnknownDeliveryTag {
                queue: "q".to_string(),
                tag: 7,
            }
            .is_missing_queue()
        );
    }
}
