//! Plan Definition Module
//!
//! Static, immutable descriptions of what an execution runs.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Plan, PlanNode, adviser configuration)
//! - [`ambiance`]: Immutable execution context threaded through every call
//! - [`condition`]: Skip-condition expressions
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Reference and cycle checks

pub mod ambiance;
pub mod condition;
pub mod model;
pub mod parser;
pub mod validator;

pub use ambiance::{Ambiance, Level};
pub use condition::OutcomeMap;
pub use model::{AdviserConfig, AdviserKind, FacilitatorParams, Plan, PlanNode, RepairAction};
pub use parser::{load_plan, parse_plan};
pub use validator::validate_plan;
