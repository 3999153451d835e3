//! Runtime Execution Records
//!
//! Mutable records of one plan run and each node inside it. Records are
//! only ever changed through version-guarded updates in the store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::status::Status;
use crate::orchestration::advisor::AdviseKind;
use crate::orchestration::facilitator::ExecutionMode;
use crate::plan::{Ambiance, Plan, PlanNode};

/// Failure categories reported with a failed node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    Unknown,
    Application,
    Connectivity,
    Authentication,
    Authorization,
    Verification,
    Expired,
    Aborted,
    Skipping,
    Internal,
}

/// Why a node failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
    #[serde(default)]
    pub failure_types: Vec<FailureType>,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>, failure_types: Vec<FailureType>) -> Self {
        Self {
            message: message.into(),
            failure_types,
        }
    }
}

/// Free-form metadata about how an execution was triggered.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    #[serde(default)]
    pub run_sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<String>,
    /// Governance / validation results attached by upstream collaborators
    #[serde(default)]
    pub governance: Value,
}

/// One run of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanExecution {
    pub id: String,
    pub plan: Arc<Plan>,
    pub status: Status,
    pub version: u64,
    pub setup_abstractions: BTreeMap<String, String>,
    pub expression_functor_token: i64,
    #[serde(default)]
    pub metadata: ExecutionMetadata,
    /// Set by ABORT_ALL; no further nodes start once raised
    #[serde(default)]
    pub abort_requested: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl PlanExecution {
    /// Creates a QUEUED plan execution with a fresh id.
    pub fn new(plan: Arc<Plan>, setup_abstractions: BTreeMap<String, String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id: id.to_string(),
            plan,
            status: Status::Queued,
            version: 0,
            setup_abstractions,
            // Low 63 bits of the id keep tokens unique per execution.
            expression_functor_token: (id.as_u128() as u64 & i64::MAX as u64) as i64,
            metadata: ExecutionMetadata::default(),
            abort_requested: false,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    /// Root ambiance (no levels) for this execution.
    pub fn root_ambiance(&self) -> Ambiance {
        Ambiance::new(
            self.id.clone(),
            self.setup_abstractions.clone(),
            self.expression_functor_token,
        )
    }
}

/// Runtime record of one node's execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    /// Runtime id, also the innermost ambiance level's runtime id
    pub id: String,
    pub plan_execution_id: String,
    pub plan_node_id: String,
    pub identifier: String,
    pub step_type: String,
    pub ambiance: Ambiance,
    pub status: Status,
    /// Bumped on every update; updates compare-and-swap on it
    pub version: u64,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Same-level predecessor
    #[serde(default)]
    pub previous_id: Option<String>,
    /// Earlier attempts of this node, oldest first
    #[serde(default)]
    pub retry_ids: Vec<String>,
    /// True once a newer attempt superseded this one
    #[serde(default)]
    pub old_retry: bool,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    #[serde(default)]
    pub correlation_ids: Vec<String>,
    /// Child chains started so far (sequential CHILDREN progress)
    #[serde(default)]
    pub started_children: usize,
    /// Child chains that have run to completion
    #[serde(default)]
    pub ended_children: usize,
    #[serde(default)]
    pub outcomes: HashMap<String, Value>,
    #[serde(default)]
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub advise: Option<AdviseKind>,
    /// Terminal status held back while waiting for manual intervention
    #[serde(default)]
    pub intervention_status: Option<Status>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub waiting_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timeout_at: Option<DateTime<Utc>>,
}

impl NodeExecution {
    /// Creates a QUEUED execution for `node`.
    ///
    /// `ambiance` is the context of the level above; the new node's own level
    /// is pushed on top of it.
    pub fn new(
        plan_execution_id: &str,
        node: &PlanNode,
        ambiance: &Ambiance,
        parent_id: Option<String>,
        previous_id: Option<String>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let level = crate::plan::Level {
            runtime_id: id.clone(),
            setup_id: node.id.clone(),
            identifier: node.identifier.clone(),
            step_type: node.step_type.clone(),
            group: node.group.clone(),
        };

        Self {
            ambiance: ambiance.with_level(level),
            id,
            plan_execution_id: plan_execution_id.to_string(),
            plan_node_id: node.id.clone(),
            identifier: node.identifier.clone(),
            step_type: node.step_type.clone(),
            status: Status::Queued,
            version: 0,
            parent_id,
            previous_id,
            retry_ids: Vec::new(),
            old_retry: false,
            mode: None,
            correlation_ids: Vec::new(),
            started_children: 0,
            ended_children: 0,
            outcomes: HashMap::new(),
            failure_info: None,
            advise: None,
            intervention_status: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            waiting_since: None,
            timeout_at: None,
        }
    }

    /// Creates the next attempt of a node after a retry.
    pub fn new_attempt(&self, node: &PlanNode) -> Self {
        let mut attempt = Self::new(
            &self.plan_execution_id,
            node,
            &self.ambiance.without_last_level(),
            self.parent_id.clone(),
            self.previous_id.clone(),
        );
        attempt.retry_ids = self.retry_ids.clone();
        attempt.retry_ids.push(self.id.clone());
        attempt
    }

    /// Number of earlier attempts.
    pub fn retry_count(&self) -> usize {
        self.retry_ids.len()
    }

    /// True when the node failed but an adviser chose to carry on anyway.
    pub fn is_ignored_failure(&self) -> bool {
        self.status.is_failure() && self.advise == Some(AdviseKind::Proceed)
    }

    /// Whether this record contributes to its parent's or plan's status.
    pub fn counts_toward_status(&self) -> bool {
        !self.old_retry && !self.is_ignored_failure()
    }

    pub fn failure_types(&self) -> Vec<FailureType> {
        self.failure_info
            .as_ref()
            .map(|f| f.failure_types.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanNode;

    fn plan_execution() -> PlanExecution {
        let plan = Plan::from_nodes("p", "a", vec![PlanNode::new("a", "Noop")]);
        PlanExecution::new(Arc::new(plan), BTreeMap::new())
    }

    #[test]
    fn test_plan_execution_starts_queued() {
        let execution = plan_execution();
        assert_eq!(execution.status, Status::Queued);
        assert_eq!(execution.version, 0);
        assert!(execution.expression_functor_token >= 0);
        assert_eq!(execution.root_ambiance().plan_execution_id, execution.id);
    }

    #[test]
    fn test_node_execution_pushes_level() {
        let execution = plan_execution();
        let node = PlanNode::new("a", "Noop").with_group("STAGE");
        let record = NodeExecution::new(&execution.id, &node, &execution.root_ambiance(), None, None);

        assert_eq!(record.status, Status::Queued);
        assert_eq!(record.ambiance.depth(), 1);
        let level = record.ambiance.current_level().unwrap();
        assert_eq!(level.runtime_id, record.id);
        assert_eq!(level.group.as_deref(), Some("STAGE"));
    }

    #[test]
    fn test_new_attempt_links_history() {
        let execution = plan_execution();
        let node = PlanNode::new("a", "Noop");
        let first = NodeExecution::new(
            &execution.id,
            &node,
            &execution.root_ambiance(),
            Some("parent".to_string()),
            Some("prev".to_string()),
        );
        let second = first.new_attempt(&node);
        let third = second.new_attempt(&node);

        assert_ne!(second.id, first.id);
        assert_eq!(third.retry_ids, vec![first.id.clone(), second.id.clone()]);
        assert_eq!(third.retry_count(), 2);
        assert_eq!(third.parent_id.as_deref(), Some("parent"));
        assert_eq!(third.previous_id.as_deref(), Some("prev"));
        assert_eq!(third.ambiance.depth(), 1);
        assert_eq!(third.ambiance.current_runtime_id(), Some(third.id.as_str()));
    }

    #[test]
    fn test_ignored_failure_does_not_count() {
        let execution = plan_execution();
        let mut record = NodeExecution::new(
            &execution.id,
            &PlanNode::new("a", "Noop"),
            &execution.root_ambiance(),
            None,
            None,
        );
        record.status = Status::Failed;
        assert!(record.counts_toward_status());

        record.advise = Some(AdviseKind::Proceed);
        assert!(record.is_ignored_failure());
        assert!(!record.counts_toward_status());

        record.advise = Some(AdviseKind::Retry);
        record.old_retry = true;
        assert!(!record.counts_toward_status());
    }
}
