//! RelayQ - embedded durable message relay
//!
//! RelayQ provides named, durable queues with the small slice of AMQP-style
//! semantics a control plane needs: publish, leased get, explicit ack,
//! recovery of unacked deliveries, and reply-to/correlation-id properties for
//! request/reply exchanges. Everything lives in process memory; "durable"
//! means a delivery survives the death of its consumer, not of the relay
//! itself.
//!
//! # Modules
//!
//! - [`broker`] - The relay itself: queue declaration, publish/get/ack
//! - [`message`] - Delivery payloads and message properties
//! - [`error`] - Typed broker errors

pub mod broker;
pub mod error;
pub mod message;

pub use broker::Broker;
pub use error::BrokerError;
pub use message::{Delivery, Properties};
