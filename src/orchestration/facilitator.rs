//! Facilitation
//!
//! Decides how a node runs once it reaches the front of the queue: inline on
//! the worker (SYNC), by dispatching external work (TASK) or by starting
//! child chains (CHILD / CHILDREN).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::{Ambiance, FacilitatorParams, OutcomeMap};

/// How a node is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Sync,
    Task,
    /// Runs the first child chain only
    Child,
    Children {
        parallel: bool,
    },
}

impl ExecutionMode {
    /// True for modes whose node completes through fan-in.
    pub fn has_children(self) -> bool {
        matches!(self, ExecutionMode::Child | ExecutionMode::Children { .. })
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Sync => write!(f, "SYNC"),
            ExecutionMode::Task => write!(f, "TASK"),
            ExecutionMode::Child => write!(f, "CHILD"),
            ExecutionMode::Children { parallel: true } => write!(f, "CHILDREN (parallel)"),
            ExecutionMode::Children { parallel: false } => write!(f, "CHILDREN (sequential)"),
        }
    }
}

/// Result of facilitation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacilitatorResponse {
    pub mode: ExecutionMode,
    /// Delay before the node starts
    pub initial_wait: Duration,
}

/// Facilitation logic supplied by a step type outside the built-in set.
///
/// Implementations must be deterministic and free of side effects.
pub trait CustomFacilitator: Send + Sync {
    fn facilitate(
        &self,
        ambiance: &Ambiance,
        step_parameters: &Value,
        params: &FacilitatorParams,
        inputs: &OutcomeMap,
    ) -> FacilitatorResponse;
}

/// Facilitator attached to a step type in the registry.
#[derive(Clone)]
pub enum Facilitator {
    Sync,
    Task,
    Child,
    Children,
    Custom(Arc<dyn CustomFacilitator>),
}

impl Facilitator {
    /// Picks the execution mode and initial wait for a node.
    pub fn facilitate(
        &self,
        ambiance: &Ambiance,
        step_parameters: &Value,
        params: &FacilitatorParams,
        inputs: &OutcomeMap,
    ) -> FacilitatorResponse {
        let mode = match self {
            Facilitator::Sync => ExecutionMode::Sync,
            Facilitator::Task => ExecutionMode::Task,
            Facilitator::Child => ExecutionMode::Child,
            Facilitator::Children => ExecutionMode::Children {
                parallel: params.parallel,
            },
            Facilitator::Custom(custom) => {
                return custom.facilitate(ambiance, step_parameters, params, inputs)
            }
        };

        FacilitatorResponse {
            mode,
            initial_wait: Duration::from_secs(params.initial_wait_secs),
        }
    }
}

impl fmt::Debug for Facilitator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Facilitator::Sync => write!(f, "Sync"),
            Facilitator::Task => write!(f, "Task"),
            Facilitator::Child => write!(f, "Child"),
            Facilitator::Children => write!(f, "Children"),
            Facilitator::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn ambiance() -> Ambiance {
        Ambiance::new("plan-1".to_string(), BTreeMap::new(), 7)
    }

    struct AlwaysTaskAfterSetup;

    impl CustomFacilitator for AlwaysTaskAfterSetup {
        fn facilitate(
            &self,
            ambiance: &Ambiance,
            _step_parameters: &Value,
            _params: &FacilitatorParams,
            _inputs: &OutcomeMap,
        ) -> FacilitatorResponse {
            let mode = if ambiance.setup_abstraction("remote").is_some() {
                ExecutionMode::Task
            } else {
                ExecutionMode::Sync
            };
            FacilitatorResponse {
                mode,
                initial_wait: Duration::ZERO,
            }
        }
    }

    #[test]
    fn test_builtin_modes() {
        let params = FacilitatorParams::default();
        let inputs = OutcomeMap::new();

        let sync = Facilitator::Sync.facilitate(&ambiance(), &Value::Null, &params, &inputs);
        assert_eq!(sync.mode, ExecutionMode::Sync);
        assert_eq!(sync.initial_wait, Duration::ZERO);

        let task = Facilitator::Task.facilitate(&ambiance(), &Value::Null, &params, &inputs);
        assert_eq!(task.mode, ExecutionMode::Task);

        let child = Facilitator::Child.facilitate(&ambiance(), &Value::Null, &params, &inputs);
        assert!(child.mode.has_children());
    }

    #[test]
    fn test_children_follow_parallel_flag() {
        let inputs = OutcomeMap::new();
        let sequential = FacilitatorParams {
            initial_wait_secs: 3,
            parallel: false,
        };

        let response = Facilitator::Children.facilitate(&ambiance(), &Value::Null, &sequential, &inputs);
        assert_eq!(response.mode, ExecutionMode::Children { parallel: false });
        assert_eq!(response.initial_wait, Duration::from_secs(3));
    }

    #[test]
    fn test_custom_facilitator() {
        let facilitator = Facilitator::Custom(Arc::new(AlwaysTaskAfterSetup));
        let params = FacilitatorParams::default();
        let inputs = OutcomeMap::new();

        let local = facilitator.facilitate(&ambiance(), &Value::Null, &params, &inputs);
        assert_eq!(local.mode, ExecutionMode::Sync);

        let mut setup = BTreeMap::new();
        setup.insert("remote".to_string(), "yes".to_string());
        let remote_ambiance = Ambiance::new("plan-1".to_string(), setup, 7);
        let remote = facilitator.facilitate(&remote_ambiance, &Value::Null, &params, &inputs);
        assert_eq!(remote.mode, ExecutionMode::Task);
        assert_eq!(format!("{:?}", facilitator), "Custom(..)");
    }

    #[test]
    fn test_mode_serialization() {
        let json = serde_json::to_string(&ExecutionMode::Task).unwrap();
        assert_eq!(json, "\"TASK\"");
        let children: ExecutionMode = serde_json::from_str("{\"CHILDREN\":{\"parallel\":true}}").unwrap();
        assert_eq!(children, ExecutionMode::Children { parallel: true });
    }
}
