//! Engine error taxonomy

use thiserror::Error;

use crate::rts::RtsError;

/// Errors that can occur while assembling or running a workflow
#[derive(Debug, Error)]
pub enum EngineError {
    /// An argument had the wrong semantic type
    #[error("expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Required configuration is absent
    #[error("'{object}' is missing required attribute '{attribute}'")]
    Missing { object: String, attribute: String },

    /// A value fell outside its allowed enumeration
    #[error("invalid value for '{object}': {detail}")]
    Value { object: String, detail: String },

    /// Queue transport failure
    #[error("broker failure: {0}")]
    Broker(#[from] relayq::BrokerError),

    /// Runtime system failure
    #[error("runtime system failure: {0}")]
    Rts(#[from] RtsError),

    /// The synchronizer never acknowledged a proposal
    #[error("no ack for '{uid}' after {attempts} attempts")]
    AckTimeout { uid: String, attempts: u32 },

    /// A wire payload could not be decoded
    #[error("message decode failure: {0}")]
    Decode(#[from] serde_json::Error),

    /// Execution was interrupted by the user (Ctrl-C)
    #[error("execution interrupted by user")]
    Interrupted,

    /// A supervised worker died and could not be recovered
    #[error("worker '{0}' terminated unexpectedly")]
    WorkerDied(String),
}

impl EngineError {
    /// Wrong-type error with rendered type names
    pub fn type_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        EngineError::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Missing-attribute error
    pub fn missing(object: impl Into<String>, attribute: impl Into<String>) -> Self {
        EngineError::Missing {
            object: object.into(),
            attribute: attribute.into(),
        }
    }

    /// Invalid-value error
    pub fn value(object: impl Into<String>, detail: impl Into<String>) -> Self {
        EngineError::Value {
            object: object.into(),
            detail: detail.into(),
        }
    }

    /// Check whether the error is worth retrying at the transport level
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Broker(_) | EngineError::AckTimeout { .. })
    }
}
