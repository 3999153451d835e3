//! Resource Restraint Module
//!
//! Capacity limits on scarce resources shared between executions.
//!
//! # Components
//!
//! - [`ResourceRestraintService`]: Per-unit permit queues
//! - [`ResourceConstraintStep`]: Step type acquiring permits
//! - [`RestraintReleaser`]: Observer returning permits

pub mod model;
pub mod service;
pub mod step;

pub use model::{HoldingScope, InstanceState, ResourceRestraint, RestraintInstance};
pub use service::{ActivationListener, ResourceRestraintService};
pub use step::{install, NotifyOnActivation, ResourceConstraintStep, RestraintReleaser, DEFAULT_RESOURCE_UNIT};
