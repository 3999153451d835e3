//! PlanRunner - Workflow Orchestration Engine
//!
//! Executes statically defined plans of steps. Each run advances its nodes
//! through a status state machine, suspends on long-running external work
//! and resumes when that work reports back. It limits access to scarce
//! resources and reacts to operator interrupts.
//!
//! # Architecture
//!
//! - [`plan`]: Plan definitions, parsing, validation and skip conditions
//! - [`execution`]: Status state machine and execution records
//! - [`orchestration`]: The engine, facilitators, advisers and interrupts
//! - [`waiting`]: Correlation-id based wait/notify
//! - [`restraint`]: Capacity-limited resource queues
//! - [`store`]: Persistence boundary and the in-memory store
//! - [`dispatch`]: Hand-off of TASK work
//! - [`monitoring`]: Observers and the execution timeline
//! - [`steps`]: Built-in step types
//!
//! # Example
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::time::Duration;
//! use planrunner::{load_plan, OrchestrationEngine};
//! use planrunner::steps::builtin_registry;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load a plan from YAML
//!     let plan = load_plan("release.yaml")?;
//!
//!     // Create the engine with the built-in steps
//!     let engine = OrchestrationEngine::builder()
//!         .registry(builtin_registry())
//!         .build()?;
//!
//!     // Run the plan to completion
//!     let execution = engine.start_execution(plan, BTreeMap::new())?;
//!     let finished = engine.wait_for_plan(&execution.id, Duration::from_secs(300))?;
//!     println!("{}", finished.status);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod orchestration;
pub mod plan;
pub mod restraint;
pub mod steps;
pub mod store;
pub mod waiting;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, PlanError, RestraintError, StepError, StoreError};
pub use execution::{NodeExecution, PlanExecution, Status};
pub use orchestration::engine::{EngineBuilder, OrchestrationEngine};
pub use orchestration::interrupt::{InterruptPackage, InterruptType};
pub use plan::model::{Plan, PlanNode};
pub use plan::parser::load_plan;
pub use store::{ExecutionStore, MemoryStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "PlanRunner";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "PlanRunner");
    }

    #[test]
    fn test_module_exports_plan() {
        let plan = Plan::from_nodes("release", "build", vec![PlanNode::new("build", "Noop")]);
        assert_eq!(plan.len(), 1);
        assert!(plan.start_node().is_some());
    }

    #[test]
    fn test_module_exports_status() {
        assert!(Status::Succeeded.is_terminal());
        assert!(!Status::Queued.is_terminal());
    }
}
