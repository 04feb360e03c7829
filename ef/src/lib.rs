//! EnsembleFlow - ensemble workflow execution engine
//!
//! EnsembleFlow drives workflows made of independent **pipelines** (ordered
//! sequences of **stages**, each an unordered bag of **tasks**) against a
//! runtime system that places tasks on compute resources. The control plane
//! is a handful of supervised workers coordinating exclusively over durable
//! queues:
//!
//! - The **application manager** owns the authoritative workflow replica,
//!   declares the queue topology, and supervises everything else.
//! - The **synchronizer** is the single writer of that replica; every state
//!   transition anywhere in the system is proposed to it and acknowledged
//!   before the proposer moves on.
//! - The **workflow processor** enqueues schedulable tasks and absorbs
//!   completed ones, firing user post-exec callbacks that may reshape the
//!   workflow mid-flight.
//! - The **task manager** feeds pending tasks to the runtime system and
//!   reports their fate.
//!
//! # Modules
//!
//! - [`workflow`] - Pipeline/Stage/Task model and the per-pipeline lock
//! - [`states`] - Shared state taxonomy
//! - [`appman`] - Application manager, synchronizer, supervision
//! - [`wfp`] - Workflow processor (enqueuer + dequeuer)
//! - [`tmgr`] - Task manager
//! - [`rm`] - Resource description validation and reservation contract
//! - [`rts`] - Runtime system contract and local implementation
//! - [`sync`] - The publish-and-await-ack synchronization protocol
//! - [`heartbeat`] - Liveness probing between supervisor and workers

pub mod appman;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod logging;
pub mod rm;
pub mod rts;
pub mod states;
pub mod sync;
pub mod tmgr;
pub mod wfp;
pub mod worker;
pub mod workflow;

// Re-export commonly used types
pub use appman::{AppManager, QueueTopology};
pub use config::EngineConfig;
pub use error::EngineError;
pub use rm::{AllocationState, LocalResourceManager, ResourceDescription, ResourceManager};
pub use rts::{LocalRts, Rts, RtsError, RtsUpdate};
pub use states::State;
pub use sync::SyncProposal;
pub use tmgr::TaskManager;
pub use wfp::WfProcessor;
pub use workflow::{
    CpuReqs, GpuReqs, Pipeline, PostExecCtx, SharedPipeline, Stage, Task, TaskFailurePolicy,
    Workflow,
};
