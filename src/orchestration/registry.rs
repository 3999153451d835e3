//! Step Registry
//!
//! Maps a step type to everything the engine needs to run it: the
//! facilitator that picks its mode, the default advisers and the executor.
//! The registry is built once at the composition root and read-only after.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::facilitator::Facilitator;
use crate::dispatch::{TaskDispatcher, TaskRequest};
use crate::error::StepError;
use crate::execution::{FailureInfo, FailureType, NodeExecution, Status};
use crate::plan::{AdviserConfig, Ambiance, OutcomeMap, PlanNode};
use crate::waiting::NotifyResponse;

/// What a step sees while it runs.
pub struct StepContext<'a> {
    pub node: &'a NodeExecution,
    pub plan_node: &'a PlanNode,
    /// Outcomes of nodes that already finished in this plan execution
    pub inputs: &'a OutcomeMap,
}

impl<'a> StepContext<'a> {
    pub fn ambiance(&self) -> &Ambiance {
        &self.node.ambiance
    }

    pub fn parameters(&self) -> &Value {
        &self.plan_node.step_parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.plan_node.step_parameters.get(name)
    }

    /// Builds the dispatch request for this node.
    pub fn task_request(&self) -> TaskRequest {
        TaskRequest {
            node_execution_id: self.node.id.clone(),
            plan_execution_id: self.node.plan_execution_id.clone(),
            step_type: self.node.step_type.clone(),
            parameters: self.plan_node.step_parameters.clone(),
            ambiance: self.node.ambiance.clone(),
        }
    }
}

/// Terminal result of a step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResponse {
    pub status: Status,
    pub outcomes: HashMap<String, Value>,
    pub failure: Option<FailureInfo>,
}

impl StepResponse {
    pub fn success() -> Self {
        Self {
            status: Status::Succeeded,
            outcomes: HashMap::new(),
            failure: None,
        }
    }

    pub fn failed(message: impl Into<String>, failure_types: Vec<FailureType>) -> Self {
        Self {
            status: Status::Failed,
            outcomes: HashMap::new(),
            failure: Some(FailureInfo::new(message, failure_types)),
        }
    }

    pub fn skipped() -> Self {
        Self {
            status: Status::Skipped,
            ..Self::success()
        }
    }

    pub fn with_outcome(mut self, name: impl Into<String>, value: Value) -> Self {
        self.outcomes.insert(name.into(), value);
        self
    }

    pub fn failure_types(&self) -> Vec<FailureType> {
        self.failure
            .as_ref()
            .map(|f| f.failure_types.clone())
            .unwrap_or_default()
    }
}

impl From<StepError> for StepResponse {
    fn from(err: StepError) -> Self {
        StepResponse::failed(err.to_string(), err.failure_types())
    }
}

/// A step that completes on the worker thread.
pub trait SyncExecutor: Send + Sync {
    fn execute(&self, ctx: &StepContext<'_>) -> Result<StepResponse, StepError>;
}

/// A step that hands work off and completes on notification.
pub trait TaskExecutor: Send + Sync {
    /// Starts the work and returns the correlation ids to wait on.
    fn start(&self, ctx: &StepContext<'_>, dispatcher: &dyn TaskDispatcher) -> Result<Vec<String>, StepError> {
        let correlation_id = dispatcher
            .dispatch(&ctx.task_request())
            .map_err(|e| StepError::TransientDispatchFailure(e.to_string()))?;
        Ok(vec![correlation_id])
    }

    /// Turns the collected responses into a result.
    ///
    /// By default any error response fails the node; otherwise the payloads
    /// become outcomes (a single response under `response`, several keyed by
    /// correlation id).
    fn handle_response(&self, _ctx: &StepContext<'_>, responses: &HashMap<String, NotifyResponse>) -> StepResponse {
        if let Some(error) = responses.values().find(|r| r.is_error) {
            let message = match &error.data {
                Value::String(s) => s.clone(),
                Value::Null => "Task reported an error".to_string(),
                other => other.to_string(),
            };
            return StepResponse::failed(message, vec![FailureType::Application]);
        }

        if responses.len() == 1 {
            let data = responses.values().map(|r| r.data.clone()).next().unwrap_or(Value::Null);
            return StepResponse::success().with_outcome("response", data);
        }

        responses
            .iter()
            .fold(StepResponse::success(), |acc, (cid, r)| acc.with_outcome(cid.clone(), r.data.clone()))
    }
}

/// How a step type's work is performed.
#[derive(Clone)]
pub enum Executor {
    Sync(Arc<dyn SyncExecutor>),
    Task(Arc<dyn TaskExecutor>),
    /// No work of its own; completes through its children
    Section,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Executor::Sync(_) => write!(f, "Sync(..)"),
            Executor::Task(_) => write!(f, "Task(..)"),
            Executor::Section => write!(f, "Section"),
        }
    }
}

/// Registry entry for one step type.
#[derive(Debug, Clone)]
pub struct StepDefinition {
    pub facilitator: Facilitator,
    /// Applied after the node's own advisers
    pub advisers: Vec<AdviserConfig>,
    pub executor: Executor,
}

impl StepDefinition {
    pub fn sync(executor: impl SyncExecutor + 'static) -> Self {
        Self {
            facilitator: Facilitator::Sync,
            advisers: Vec::new(),
            executor: Executor::Sync(Arc::new(executor)),
        }
    }

    pub fn task(executor: impl TaskExecutor + 'static) -> Self {
        Self {
            facilitator: Facilitator::Task,
            advisers: Vec::new(),
            executor: Executor::Task(Arc::new(executor)),
        }
    }

    pub fn section() -> Self {
        Self {
            facilitator: Facilitator::Children,
            advisers: Vec::new(),
            executor: Executor::Section,
        }
    }

    pub fn with_facilitator(mut self, facilitator: Facilitator) -> Self {
        self.facilitator = facilitator;
        self
    }

    pub fn with_adviser(mut self, adviser: AdviserConfig) -> Self {
        self.advisers.push(adviser);
        self
    }
}

/// Step type to definition map.
#[derive(Debug, Clone, Default)]
pub struct StepRegistry {
    steps: HashMap<String, StepDefinition>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a step type.
    pub fn register(&mut self, step_type: impl Into<String>, definition: StepDefinition) -> &mut Self {
        self.steps.insert(step_type.into(), definition);
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, step_type: impl Into<String>, definition: StepDefinition) -> Self {
        self.register(step_type, definition);
        self
    }

    pub fn get(&self, step_type: &str) -> Option<&StepDefinition> {
        self.steps.get(step_type)
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.steps.contains_key(step_type)
    }

    /// Registered step types, sorted.
    pub fn step_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.steps.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::RecordingDispatcher;
    use crate::execution::PlanExecution;
    use crate::plan::Plan;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct Echo;

    impl SyncExecutor for Echo {
        fn execute(&self, ctx: &StepContext<'_>) -> Result<StepResponse, StepError> {
            Ok(StepResponse::success().with_outcome("echo", ctx.parameters().clone()))
        }
    }

    struct DefaultTask;

    impl TaskExecutor for DefaultTask {}

    fn fixture() -> (PlanNode, NodeExecution) {
        let node = PlanNode::new("a", "Echo").with_parameters(json!({"x": 1}));
        let plan = Plan::from_nodes("p", "a", vec![node.clone()]);
        let execution = PlanExecution::new(Arc::new(plan), BTreeMap::new());
        let record = NodeExecution::new(&execution.id, &node, &execution.root_ambiance(), None, None);
        (node, record)
    }

    fn response(cid: &str, data: Value, is_error: bool) -> NotifyResponse {
        NotifyResponse {
            correlation_id: cid.to_string(),
            data,
            is_error,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_registry_lookup() {
        let registry = StepRegistry::new()
            .with("Echo", StepDefinition::sync(Echo))
            .with("Section", StepDefinition::section());

        assert!(registry.contains("Echo"));
        assert!(!registry.contains("Missing"));
        assert_eq!(registry.step_types(), vec!["Echo".to_string(), "Section".to_string()]);
        assert!(matches!(registry.get("Section").unwrap().executor, Executor::Section));
    }

    #[test]
    fn test_sync_executor_sees_parameters() {
        let (plan_node, record) = fixture();
        let inputs = OutcomeMap::new();
        let ctx = StepContext {
            node: &record,
            plan_node: &plan_node,
            inputs: &inputs,
        };

        let result = Echo.execute(&ctx).unwrap();
        assert_eq!(result.status, Status::Succeeded);
        assert_eq!(result.outcomes["echo"], json!({"x": 1}));
    }

    #[test]
    fn test_default_task_start_dispatches() {
        let (plan_node, record) = fixture();
        let inputs = OutcomeMap::new();
        let ctx = StepContext {
            node: &record,
            plan_node: &plan_node,
            inputs: &inputs,
        };
        let dispatcher = RecordingDispatcher::new();

        let cids = DefaultTask.start(&ctx, &dispatcher).unwrap();
        assert_eq!(cids.len(), 1);
        assert_eq!(dispatcher.dispatched()[0].1.node_execution_id, record.id);

        dispatcher.set_unavailable(Some("down"));
        let err = DefaultTask.start(&ctx, &dispatcher).unwrap_err();
        assert!(matches!(err, StepError::TransientDispatchFailure(_)));
    }

    #[test]
    fn test_default_response_handling() {
        let (plan_node, record) = fixture();
        let inputs = OutcomeMap::new();
        let ctx = StepContext {
            node: &record,
            plan_node: &plan_node,
            inputs: &inputs,
        };

        let mut single = HashMap::new();
        single.insert("c1".to_string(), response("c1", json!({"ok": true}), false));
        let result = DefaultTask.handle_response(&ctx, &single);
        assert_eq!(result.status, Status::Succeeded);
        assert_eq!(result.outcomes["response"], json!({"ok": true}));

        let mut failed = HashMap::new();
        failed.insert("c1".to_string(), response("c1", json!("disk full"), true));
        let result = DefaultTask.handle_response(&ctx, &failed);
        assert_eq!(result.status, Status::Failed);
        assert_eq!(result.failure.unwrap().message, "disk full");
    }

    #[test]
    fn test_step_error_conversion() {
        let response: StepResponse = StepError::TransientDispatchFailure("timeout".to_string()).into();
        assert_eq!(response.status, Status::Failed);
        assert_eq!(response.failure_types(), vec![FailureType::Connectivity]);
    }
}
