//! Plan Data Model
//!
//! Static, immutable description of the graph a plan execution runs.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: deploy_service
//! start: build
//! nodes:
//!   - id: build
//!     step_type: Noop
//!     next: deploy
//!
//!   - id: deploy
//!     step_type: Task
//!     timeout_secs: 600
//!     step_parameters:
//!       artifact: service.tar.gz
//!     advisers:
//!       - type: retry
//!         on: [FAILED, EXPIRED]
//!         max_retries: 2
//!         wait_intervals_secs: [5, 30]
//!     next: verify
//!
//!   - id: verify
//!     step_type: Section
//!     facilitator:
//!       parallel: true
//!     children: [smoke_test, canary_check]
//! ```
//!
//! Successors at the same level are linked through `next`; nested sections
//! list the roots of their child chains in `children`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::execution::{FailureType, Status};

/// Parameters handed to the node's facilitator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FacilitatorParams {
    /// Seconds to hold a task before dispatching it
    #[serde(default)]
    pub initial_wait_secs: u64,

    /// Whether CHILDREN run in parallel (true) or in declared order (false)
    #[serde(default = "default_parallel")]
    pub parallel: bool,
}

fn default_parallel() -> bool {
    true
}

impl Default for FacilitatorParams {
    fn default() -> Self {
        Self {
            initial_wait_secs: 0,
            parallel: true,
        }
    }
}

/// What to do once a retry adviser has used up its attempts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    #[default]
    MarkFailed,
    EndPlan,
    Ignore,
    ManualIntervention,
}

/// Kind of an adviser and its settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdviserKind {
    /// Re-run the node as a fresh attempt.
    Retry {
        max_retries: u32,
        /// Backoff per attempt; the last value repeats
        #[serde(default)]
        wait_intervals_secs: Vec<u64>,
        #[serde(default)]
        on_exhausted: RepairAction,
    },
    /// Park the node until an operator sends a MARK_* / RETRY / ABORT interrupt.
    ManualIntervention {
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    /// Treat the failure as success and continue.
    Ignore,
    MarkFailed,
    EndPlan,
}

/// One adviser attached to a node.
///
/// Advisers are evaluated in declaration order; the first whose trigger
/// matches the node's terminal status wins.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AdviserConfig {
    /// Trigger statuses; empty means every failure status
    #[serde(default)]
    pub on: Vec<Status>,

    /// Optional failure categories that must be present
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_types: Vec<FailureType>,

    #[serde(flatten)]
    pub kind: AdviserKind,
}

impl AdviserConfig {
    pub fn new(kind: AdviserKind) -> Self {
        Self {
            on: Vec::new(),
            failure_types: Vec::new(),
            kind,
        }
    }

    /// Restricts the trigger to the given statuses.
    pub fn on(mut self, statuses: &[Status]) -> Self {
        self.on = statuses.to_vec();
        self
    }

    /// Restricts the trigger to failures carrying one of the given types.
    pub fn for_failure_types(mut self, types: &[FailureType]) -> Self {
        self.failure_types = types.to_vec();
        self
    }

    /// Returns true if this adviser applies to `status` with `failure_types`.
    pub fn matches(&self, status: Status, failure_types: &[FailureType]) -> bool {
        let status_matches = if self.on.is_empty() {
            status.is_failure()
        } else {
            self.on.contains(&status)
        };

        let type_matches = self.failure_types.is_empty()
            || self.failure_types.iter().any(|t| failure_types.contains(t));

        status_matches && type_matches
    }
}

/// A single node of a plan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlanNode {
    /// Unique id within the plan
    pub id: String,

    /// Human-readable identifier (defaults to the id)
    #[serde(default)]
    pub identifier: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Registry key selecting facilitator, advisers and executor
    pub step_type: String,

    /// Opaque parameters for the step
    #[serde(default)]
    pub step_parameters: Value,

    #[serde(default)]
    pub facilitator: FacilitatorParams,

    #[serde(default)]
    pub advisers: Vec<AdviserConfig>,

    /// Expression that skips the node when it evaluates to true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_condition: Option<String>,

    /// Same-level successor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,

    /// Roots of child chains for CHILD/CHILDREN facilitation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<String>,

    /// Maximum seconds the node may spend waiting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Level group recorded in the ambiance (e.g. "STAGE")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl PlanNode {
    /// Creates a node with the given id and step type.
    ///
    /// # Example
    ///
    /// ```
    /// use planrunner::plan::PlanNode;
    ///
    /// let node = PlanNode::new("deploy", "Task")
    ///     .with_next("verify")
    ///     .with_timeout_secs(300);
    /// assert_eq!(node.identifier, "deploy");
    /// ```
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        let id = id.into().trim().to_string();
        Self {
            identifier: id.clone(),
            id,
            name: None,
            step_type: step_type.into().trim().to_string(),
            step_parameters: Value::Null,
            facilitator: FacilitatorParams::default(),
            advisers: Vec::new(),
            skip_condition: None,
            next: None,
            children: Vec::new(),
            timeout_secs: None,
            group: None,
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.step_parameters = parameters;
        self
    }

    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    pub fn with_children(mut self, children: &[&str]) -> Self {
        self.children = children.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Runs CHILDREN one after another in declared order.
    pub fn sequential(mut self) -> Self {
        self.facilitator.parallel = false;
        self
    }

    pub fn with_initial_wait_secs(mut self, secs: u64) -> Self {
        self.facilitator.initial_wait_secs = secs;
        self
    }

    pub fn with_adviser(mut self, adviser: AdviserConfig) -> Self {
        self.advisers.push(adviser);
        self
    }

    pub fn with_skip_condition(mut self, condition: impl Into<String>) -> Self {
        self.skip_condition = Some(condition.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Ids this node refers to.
    pub fn references(&self) -> impl Iterator<Item = &String> {
        self.next.iter().chain(self.children.iter())
    }
}

/// A complete plan: a set of nodes and the node execution starts at.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Plan {
    pub id: String,

    /// Id of the first node
    pub start: String,

    pub nodes: Vec<PlanNode>,
}

impl Plan {
    /// Creates an empty plan.
    pub fn new(id: impl Into<String>, start: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            start: start.into(),
            nodes: Vec::new(),
        }
    }

    /// Creates a plan from a list of nodes.
    pub fn from_nodes(id: impl Into<String>, start: impl Into<String>, nodes: Vec<PlanNode>) -> Self {
        let mut plan = Self::new(id, start);
        plan.nodes = nodes;
        plan.fill_identifiers();
        plan
    }

    /// Adds a node to the plan.
    pub fn add_node(&mut self, node: PlanNode) -> Result<(), String> {
        if self.nodes.iter().any(|n| n.id == node.id) {
            return Err(format!("Node '{}' already exists", node.id));
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Gets a node by id.
    pub fn node(&self, id: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&PlanNode> {
        self.node(&self.start)
    }

    /// Returns the node whose `children` contains `id`.
    pub fn parent_of(&self, id: &str) -> Option<&PlanNode> {
        self.nodes.iter().find(|n| n.children.iter().any(|c| c == id))
    }

    /// Defaults empty identifiers to the node id.
    pub fn fill_identifiers(&mut self) {
        for node in &mut self.nodes {
            if node.identifier.trim().is_empty() {
                node.identifier = node.id.clone();
            }
        }
    }

    /// Distinct step types used by the plan, sorted.
    pub fn step_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.nodes.iter().map(|n| n.step_type.clone()).collect();
        types.sort();
        types.dedup();
        types
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_creation_defaults() {
        let node = PlanNode::new(" build ", "Noop");
        assert_eq!(node.id, "build");
        assert_eq!(node.identifier, "build");
        assert!(node.facilitator.parallel);
        assert_eq!(node.facilitator.initial_wait_secs, 0);
        assert!(node.advisers.is_empty());
    }

    #[test]
    fn test_plan_add_node_rejects_duplicates() {
        let mut plan = Plan::new("p", "a");
        assert!(plan.add_node(PlanNode::new("a", "Noop")).is_ok());
        assert!(plan.add_node(PlanNode::new("a", "Noop")).is_err());
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_parent_lookup() {
        let plan = Plan::from_nodes(
            "p",
            "stage",
            vec![
                PlanNode::new("stage", "Section").with_children(&["a", "b"]),
                PlanNode::new("a", "Noop"),
                PlanNode::new("b", "Noop"),
            ],
        );
        assert_eq!(plan.parent_of("b").unwrap().id, "stage");
        assert!(plan.parent_of("stage").is_none());
        assert_eq!(plan.start_node().unwrap().id, "stage");
    }

    #[test]
    fn test_step_types_sorted_and_unique() {
        let plan = Plan::from_nodes(
            "p",
            "a",
            vec![
                PlanNode::new("a", "Task").with_next("b"),
                PlanNode::new("b", "Noop").with_next("c"),
                PlanNode::new("c", "Task"),
            ],
        );
        assert_eq!(plan.step_types(), vec!["Noop".to_string(), "Task".to_string()]);
    }

    #[test]
    fn test_adviser_matches_failures_by_default() {
        let adviser = AdviserConfig::new(AdviserKind::Ignore);
        assert!(adviser.matches(Status::Failed, &[]));
        assert!(adviser.matches(Status::Expired, &[]));
        assert!(!adviser.matches(Status::Succeeded, &[]));
    }

    #[test]
    fn test_adviser_matches_explicit_status_and_type() {
        let adviser = AdviserConfig::new(AdviserKind::MarkFailed)
            .on(&[Status::Failed])
            .for_failure_types(&[FailureType::Connectivity]);

        assert!(adviser.matches(Status::Failed, &[FailureType::Connectivity]));
        assert!(!adviser.matches(Status::Failed, &[FailureType::Application]));
        assert!(!adviser.matches(Status::Expired, &[FailureType::Connectivity]));
    }

    #[test]
    fn test_adviser_yaml_shape() {
        let yaml = "type: retry\non: [FAILED]\nmax_retries: 3\nwait_intervals_secs: [1, 2]\n";
        let adviser: AdviserConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(adviser.on, vec![Status::Failed]);
        match adviser.kind {
            AdviserKind::Retry {
                max_retries,
                wait_intervals_secs,
                on_exhausted,
            } => {
                assert_eq!(max_retries, 3);
                assert_eq!(wait_intervals_secs, vec![1, 2]);
                assert_eq!(on_exhausted, RepairAction::MarkFailed);
            }
            other => panic!("unexpected adviser {:?}", other),
        }
    }

    #[test]
    fn test_fill_identifiers() {
        let mut node = PlanNode::new("a", "Noop");
        node.identifier = String::new();
        let plan = Plan::from_nodes("p", "a", vec![node]);
        assert_eq!(plan.node("a").unwrap().identifier, "a");
    }
}
