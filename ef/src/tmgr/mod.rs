//! Task manager: feeds pending tasks to the runtime system
//!
//! A supervised worker with two control surfaces - `start_manager` /
//! `start_heartbeat` and a terminate event. It pulls task batches off the
//! pending queues, submits them to the runtime system, proposes every state
//! transition to the synchronizer, and publishes terminal tasks onto the
//! completed queues.

mod core;

pub use core::TaskManager;
