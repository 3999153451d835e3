//! Execution Records Module
//!
//! Runtime state of plan runs: the status state machine and the mutable
//! plan/node execution records the engine advances.

pub mod node;
pub mod status;

pub use node::{ExecutionMetadata, FailureInfo, FailureType, NodeExecution, PlanExecution};
pub use status::Status;
