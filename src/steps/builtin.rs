//! Built-in Steps
//!
//! Control-flow steps every registry starts with:
//!
//! | Step type            | Mode     | Behaviour                                   |
//! |----------------------|----------|---------------------------------------------|
//! | `Noop`               | SYNC     | Succeeds, publishing `outcomes` verbatim    |
//! | `Fail`               | SYNC     | Fails with `message` / `failure_type`       |
//! | `Task`               | TASK     | Dispatches and waits for the notification   |
//! | `Section`            | CHILDREN | Runs `children`, concludes on fan-in        |
//! | `ResourceConstraint` | TASK     | Waits for restraint permits                 |

use std::sync::Arc;

use serde_json::Value;

use crate::error::StepError;
use crate::execution::FailureType;
use crate::orchestration::registry::{StepContext, StepDefinition, StepRegistry, StepResponse, SyncExecutor, TaskExecutor};
use crate::restraint::{self, ResourceConstraintStep, ResourceRestraintService};
use crate::waiting::WaitNotifyService;

/// Succeeds immediately.
pub struct NoopStep;

impl SyncExecutor for NoopStep {
    fn execute(&self, ctx: &StepContext<'_>) -> Result<StepResponse, StepError> {
        let mut response = StepResponse::success();
        if let Some(Value::Object(outcomes)) = ctx.parameter("outcomes") {
            for (name, value) in outcomes {
                response = response.with_outcome(name.clone(), value.clone());
            }
        }
        Ok(response)
    }
}

/// Fails with a configurable message and category.
pub struct FailStep;

impl SyncExecutor for FailStep {
    fn execute(&self, ctx: &StepContext<'_>) -> Result<StepResponse, StepError> {
        let message = ctx
            .parameter("message")
            .and_then(Value::as_str)
            .unwrap_or("Step failed");
        let failure_type = ctx
            .parameter("failure_type")
            .cloned()
            .and_then(|v| serde_json::from_value::<FailureType>(v).ok())
            .unwrap_or(FailureType::Application);
        Err(StepError::failure(message, failure_type))
    }
}

/// Hands its parameters to the dispatcher.
pub struct DispatchStep;

impl TaskExecutor for DispatchStep {}

/// Registry with `Noop`, `Fail`, `Task` and `Section`.
pub fn builtin_registry() -> StepRegistry {
    StepRegistry::new()
        .with("Noop", StepDefinition::sync(NoopStep))
        .with("Fail", StepDefinition::sync(FailStep))
        .with("Task", StepDefinition::task(DispatchStep))
        .with("Section", StepDefinition::section())
}

/// Adds `ResourceConstraint` backed by `service`, and connects the
/// service's promotions to `notify`.
pub fn with_restraints(
    registry: StepRegistry,
    service: Arc<ResourceRestraintService>,
    notify: Arc<WaitNotifyService>,
) -> StepRegistry {
    restraint::install(&service, Arc::clone(&notify));
    registry.with(
        "ResourceConstraint",
        StepDefinition::task(ResourceConstraintStep::new(service, notify)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{NodeExecution, PlanExecution, Status};
    use crate::plan::{OutcomeMap, Plan, PlanNode};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn run(step: &dyn SyncExecutor, parameters: Value) -> Result<StepResponse, StepError> {
        let plan = Plan::from_nodes("p", "a", vec![PlanNode::new("a", "Noop").with_parameters(parameters)]);
        let execution = PlanExecution::new(Arc::new(plan), BTreeMap::new());
        let plan_node = execution.plan.node("a").unwrap();
        let node = NodeExecution::new(&execution.id, plan_node, &execution.root_ambiance(), None, None);
        let inputs = OutcomeMap::new();
        step.execute(&StepContext {
            node: &node,
            plan_node,
            inputs: &inputs,
        })
    }

    #[test]
    fn test_noop_publishes_outcomes() {
        let response = run(&NoopStep, json!({"outcomes": {"version": "1.2", "count": 3}})).unwrap();
        assert_eq!(response.status, Status::Succeeded);
        assert_eq!(response.outcomes["version"], json!("1.2"));
        assert_eq!(response.outcomes["count"], json!(3));

        let bare = run(&NoopStep, Value::Null).unwrap();
        assert!(bare.outcomes.is_empty());
    }

    #[test]
    fn test_fail_uses_parameters() {
        let err = run(&FailStep, json!({"message": "disk full", "failure_type": "CONNECTIVITY"})).unwrap_err();
        assert!(err.to_string().contains("disk full"));
        assert_eq!(err.failure_types(), vec![FailureType::Connectivity]);

        let default = run(&FailStep, Value::Null).unwrap_err();
        assert_eq!(default.failure_types(), vec![FailureType::Application]);
    }

    #[test]
    fn test_registries() {
        let registry = builtin_registry();
        for step_type in ["Noop", "Fail", "Task", "Section"] {
            assert!(registry.contains(step_type), "{} missing", step_type);
        }

        let service = Arc::new(ResourceRestraintService::new());
        let notify = Arc::new(WaitNotifyService::new());
        let registry = with_restraints(registry, service, notify);
        assert!(registry.contains("ResourceConstraint"));
        assert_eq!(registry.len(), 5);
    }
}
