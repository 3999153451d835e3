//! Orchestration Module
//!
//! The engine and the pieces it is assembled from.
//!
//! # Structure
//!
//! - [`engine`]: Plan advancement, fan-in, completion and recovery
//! - [`facilitator`]: Execution mode selection
//! - [`advisor`]: What happens after a terminal outcome
//! - [`registry`]: Step types and their executors
//! - [`interrupt`]: Operator control signals
//! - [`worker`]: Thread pool running engine jobs
//! - [`watcher`]: Timeout and delayed-start ticking

pub mod advisor;
pub mod engine;
pub mod facilitator;
pub mod interrupt;
pub mod registry;
pub mod watcher;
pub mod worker;

pub use advisor::{Advise, AdviseKind};
pub use engine::{EngineBuilder, OrchestrationEngine, RecoveryReport};
pub use facilitator::{CustomFacilitator, ExecutionMode, Facilitator, FacilitatorResponse};
pub use interrupt::{Interrupt, InterruptPackage, InterruptState, InterruptType};
pub use registry::{Executor, StepContext, StepDefinition, StepRegistry, StepResponse, SyncExecutor, TaskExecutor};
pub use watcher::{DelayedQueue, Watcher};
pub use worker::WorkerPool;
