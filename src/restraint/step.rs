//! Restraint Engine Wiring
//!
//! - [`ResourceConstraintStep`]: a TASK step that waits for permits
//! - [`NotifyOnActivation`]: resumes the waiting node on promotion
//! - [`RestraintReleaser`]: returns permits when their holder finishes

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use serde_json::{json, Value};

use super::model::{HoldingScope, InstanceState, RestraintInstance};
use super::service::{ActivationListener, ResourceRestraintService};
use crate::dispatch::TaskDispatcher;
use crate::error::StepError;
use crate::execution::{FailureType, NodeExecution, PlanExecution, Status};
use crate::monitoring::ExecutionObserver;
use crate::orchestration::registry::{StepContext, StepResponse, TaskExecutor};
use crate::waiting::{NotifyResponse, WaitNotifyService};

/// Unit used when a node names none.
pub const DEFAULT_RESOURCE_UNIT: &str = "global";

fn instance_payload(instance: &RestraintInstance) -> Value {
    serde_json::to_value(instance).unwrap_or(Value::Null)
}

/// Acquires permits and waits until they are granted.
///
/// Parameters:
/// - `restraint`: restraint name (required)
/// - `resource_unit`: partition, defaults to `global`
/// - `permits`: defaults to 1
/// - `scope`: `PLAN` holds until the plan ends; `NODE` (default) until
///   the enclosing section ends, or the plan at top level
pub struct ResourceConstraintStep {
    service: Arc<ResourceRestraintService>,
    notify: Arc<WaitNotifyService>,
}

impl ResourceConstraintStep {
    pub fn new(service: Arc<ResourceRestraintService>, notify: Arc<WaitNotifyService>) -> Self {
        Self { service, notify }
    }
}

fn invalid(message: impl Into<String>) -> StepError {
    StepError::failure(message, FailureType::Verification)
}

impl TaskExecutor for ResourceConstraintStep {
    fn start(&self, ctx: &StepContext<'_>, _dispatcher: &dyn TaskDispatcher) -> Result<Vec<String>, StepError> {
        let name = ctx
            .parameter("restraint")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("ResourceConstraint requires a 'restraint' parameter"))?;
        let unit = ctx
            .parameter("resource_unit")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_RESOURCE_UNIT);
        let permits = match ctx.parameter("permits") {
            None => 1,
            Some(value) => value
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| invalid(format!("Invalid permits: {}", value)))?,
        };
        let scope = match ctx.parameter("scope").and_then(Value::as_str) {
            None => HoldingScope::default(),
            Some(s) => HoldingScope::parse(s).ok_or_else(|| invalid(format!("Invalid scope '{}'", s)))?,
        };

        let restraint = self
            .service
            .restraint_by_name(name)
            .ok_or_else(|| invalid(format!("Unknown restraint '{}'", name)))?;

        let node = ctx.node;
        let release_entity_id = match scope {
            HoldingScope::Plan => node.plan_execution_id.clone(),
            HoldingScope::Node => node
                .parent_id
                .clone()
                .unwrap_or_else(|| node.plan_execution_id.clone()),
        };

        let instance = self
            .service
            .acquire(&restraint.id, unit, &release_entity_id, scope, permits)
            .map_err(|e| invalid(e.to_string()))?;

        if instance.is_active() {
            self.notify.notify(&instance.id, instance_payload(&instance));
        } else {
            debug!(
                "Node {} queued for '{}' on '{}' (order {})",
                node.identifier, restraint.name, unit, instance.order
            );
        }
        Ok(vec![instance.id])
    }

    fn handle_response(&self, _ctx: &StepContext<'_>, responses: &HashMap<String, NotifyResponse>) -> StepResponse {
        match responses.values().next() {
            Some(response) if !response.is_error => StepResponse::success().with_outcome("instance", response.data.clone()),
            _ => StepResponse::failed("Resource was not granted", vec![FailureType::Application]),
        }
    }
}

/// Notifies the waiting node when its instance is promoted.
pub struct NotifyOnActivation {
    notify: Arc<WaitNotifyService>,
}

impl ActivationListener for NotifyOnActivation {
    fn on_activated(&self, instance: &RestraintInstance) {
        if !self.notify.notify(&instance.id, instance_payload(instance)) {
            warn!("Activation of {} was already delivered", instance.id);
        }
    }
}

/// Connects restraint promotions to the notify service.
pub fn install(service: &ResourceRestraintService, notify: Arc<WaitNotifyService>) {
    service.add_listener(Arc::new(NotifyOnActivation { notify }));
}

/// Releases instances once the execution holding them is terminal.
pub struct RestraintReleaser {
    service: Arc<ResourceRestraintService>,
}

impl RestraintReleaser {
    pub fn new(service: Arc<ResourceRestraintService>) -> Self {
        Self { service }
    }
}

impl RestraintReleaser {
    /// Finishes the instances a failed, expired or aborted waiter requested.
    /// A retry acquires a fresh instance, so the old one must not keep its
    /// place in the queue or its permits.
    fn abandon(&self, node: &NodeExecution) {
        for cid in &node.correlation_ids {
            let instance = match self.service.get_instance(cid) {
                Some(instance) if instance.state != InstanceState::Finished => instance,
                _ => continue,
            };
            match self.service.finish_instance(&instance.id, &instance.resource_unit) {
                Ok(_) => debug!(
                    "Abandoned instance {} of node {} ({})",
                    instance.id, node.identifier, node.status
                ),
                Err(err) => warn!("Could not finish instance {}: {}", instance.id, err),
            }
        }
    }
}

impl ExecutionObserver for RestraintReleaser {
    fn on_node_status(&self, node: &NodeExecution, _previous: Status) {
        if !node.status.is_terminal() {
            return;
        }
        self.service
            .delete_instances_for_release_type(&[node.id.clone()], HoldingScope::Node);
        if node.status.is_failure() {
            self.abandon(node);
        }
    }

    fn on_plan_status(&self, plan: &PlanExecution, _previous: Status) {
        if !plan.status.is_terminal() {
            return;
        }
        // Top-level NODE holders are keyed by the plan as well.
        let ids = [plan.id.clone()];
        let released = self.service.delete_instances_for_release_type(&ids, HoldingScope::Plan)
            + self.service.delete_instances_for_release_type(&ids, HoldingScope::Node);
        if released > 0 {
            debug!("Released {} instance(s) held by plan {}", released, plan.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::RecordingDispatcher;
    use crate::execution::PlanExecution;
    use crate::plan::{OutcomeMap, Plan, PlanNode};
    use std::collections::BTreeMap;

    fn plan_and_node(parameters: Value) -> (PlanExecution, NodeExecution) {
        let plan = Plan::from_nodes(
            "p",
            "lock",
            vec![PlanNode::new("lock", "ResourceConstraint").with_parameters(parameters)],
        );
        let execution = PlanExecution::new(Arc::new(plan), BTreeMap::new());
        let node = NodeExecution::new(
            &execution.id,
            execution.plan.node("lock").unwrap(),
            &execution.root_ambiance(),
            None,
            None,
        );
        (execution, node)
    }

    fn start(step: &ResourceConstraintStep, execution: &PlanExecution, node: &NodeExecution) -> Result<Vec<String>, StepError> {
        let inputs = OutcomeMap::new();
        let ctx = StepContext {
            node,
            plan_node: execution.plan.node("lock").unwrap(),
            inputs: &inputs,
        };
        step.start(&ctx, &RecordingDispatcher::new())
    }

    #[test]
    fn test_immediate_grant_notifies() {
        let service = Arc::new(ResourceRestraintService::new());
        let notify = Arc::new(WaitNotifyService::new());
        service.register_restraint("deploy", 1).unwrap();
        let step = ResourceConstraintStep::new(service.clone(), notify.clone());

        let (execution, node) = plan_and_node(json!({"restraint": "deploy", "scope": "PLAN"}));
        let ids = start(&step, &execution, &node).unwrap();

        assert_eq!(ids.len(), 1);
        assert!(notify.has_unconsumed_response(&ids[0]));
        let instance = service.get_instance(&ids[0]).unwrap();
        assert_eq!(instance.release_entity_id, execution.id);
        assert_eq!(instance.resource_unit, DEFAULT_RESOURCE_UNIT);
    }

    #[test]
    fn test_blocked_grant_notifies_on_promotion() {
        let service = Arc::new(ResourceRestraintService::new());
        let notify = Arc::new(WaitNotifyService::new());
        service.register_restraint("deploy", 1).unwrap();
        install(&service, notify.clone());
        let step = ResourceConstraintStep::new(service.clone(), notify.clone());

        let (first_plan, first_node) = plan_and_node(json!({"restraint": "deploy", "scope": "PLAN"}));
        let (second_plan, second_node) = plan_and_node(json!({"restraint": "deploy", "scope": "PLAN"}));
        start(&step, &first_plan, &first_node).unwrap();
        let waiting = start(&step, &second_plan, &second_node).unwrap();

        assert_eq!(service.get_instance(&waiting[0]).unwrap().state, InstanceState::Blocked);
        assert!(!notify.has_unconsumed_response(&waiting[0]));

        let releaser = RestraintReleaser::new(service.clone());
        let mut finished = first_plan.clone();
        finished.status = Status::Succeeded;
        releaser.on_plan_status(&finished, Status::Running);

        assert!(service.get_instance(&waiting[0]).unwrap().is_active());
        assert!(notify.has_unconsumed_response(&waiting[0]));
    }

    #[test]
    fn test_failed_waiter_gives_up_its_place() {
        let service = Arc::new(ResourceRestraintService::new());
        let notify = Arc::new(WaitNotifyService::new());
        service.register_restraint("deploy", 1).unwrap();
        install(&service, notify.clone());
        let step = ResourceConstraintStep::new(service.clone(), notify.clone());
        let releaser = RestraintReleaser::new(service.clone());

        let (holder_plan, holder_node) = plan_and_node(json!({"restraint": "deploy", "scope": "PLAN"}));
        let (waiter_plan, mut waiter_node) = plan_and_node(json!({"restraint": "deploy", "scope": "PLAN"}));
        start(&step, &holder_plan, &holder_node).unwrap();
        let expired = start(&step, &waiter_plan, &waiter_node).unwrap();

        waiter_node.correlation_ids = expired.clone();
        waiter_node.status = Status::Expired;
        releaser.on_node_status(&waiter_node, Status::AsyncWaiting);
        assert_eq!(service.get_instance(&expired[0]).unwrap().state, InstanceState::Finished);

        let retry = waiter_node.new_attempt(waiter_plan.plan.node("lock").unwrap());
        let retried = start(&step, &waiter_plan, &retry).unwrap();
        assert_eq!(service.get_instance(&retried[0]).unwrap().state, InstanceState::Blocked);

        let mut finished = holder_plan.clone();
        finished.status = Status::Succeeded;
        releaser.on_plan_status(&finished, Status::Running);

        assert!(service.get_instance(&retried[0]).unwrap().is_active());
        assert!(notify.has_unconsumed_response(&retried[0]));
        assert_eq!(service.get_instance(&expired[0]).unwrap().state, InstanceState::Finished);
    }

    #[test]
    fn test_succeeded_holder_keeps_plan_permit() {
        let service = Arc::new(ResourceRestraintService::new());
        let notify = Arc::new(WaitNotifyService::new());
        service.register_restraint("deploy", 1).unwrap();
        let step = ResourceConstraintStep::new(service.clone(), notify);
        let releaser = RestraintReleaser::new(service.clone());

        let (execution, mut node) = plan_and_node(json!({"restraint": "deploy", "scope": "PLAN"}));
        node.correlation_ids = start(&step, &execution, &node).unwrap();
        node.status = Status::Succeeded;
        releaser.on_node_status(&node, Status::Running);

        assert!(service.get_instance(&node.correlation_ids[0]).unwrap().is_active());
    }

    #[test]
    fn test_parameter_validation() {
        let service = Arc::new(ResourceRestraintService::new());
        let notify = Arc::new(WaitNotifyService::new());
        service.register_restraint("deploy", 2).unwrap();
        let step = ResourceConstraintStep::new(service, notify);

        for parameters in [
            json!({}),
            json!({"restraint": "missing"}),
            json!({"restraint": "deploy", "permits": "two"}),
            json!({"restraint": "deploy", "permits": 3}),
            json!({"restraint": "deploy", "scope": "STAGE"}),
        ] {
            let (execution, node) = plan_and_node(parameters);
            let err = start(&step, &execution, &node).unwrap_err();
            assert_eq!(err.failure_types(), vec![FailureType::Verification]);
        }
    }

    #[test]
    fn test_node_scope_released_with_holder() {
        let service = Arc::new(ResourceRestraintService::new());
        let restraint = service.register_restraint("deploy", 1).unwrap();
        let held = service
            .acquire(&restraint.id, "u", "section-1", HoldingScope::Node, 1)
            .unwrap();

        let (_, mut section) = plan_and_node(json!({}));
        section.id = "section-1".to_string();
        section.status = Status::Running;

        let releaser = RestraintReleaser::new(service.clone());
        releaser.on_node_status(&section, Status::Queued);
        assert!(service.get_instance(&held.id).is_some());

        section.status = Status::Failed;
        releaser.on_node_status(&section, Status::Running);
        assert!(service.get_instance(&held.id).is_none());
    }
}
