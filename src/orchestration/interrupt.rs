//! Interrupts
//!
//! External control signals against a running plan. Registration persists
//! the interrupt and returns; the engine applies it on a worker.
//!
//! Every interrupt ends PROCESSED or DISCARDED. An interrupt is discarded
//! when its target already reached a terminal status or is not in a state
//! the interrupt can act on.

use std::fmt;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::advisor::{Advise, AdviseKind};
use super::engine::EngineInner;
use crate::error::{EngineError, Result};
use crate::execution::{FailureInfo, FailureType, NodeExecution, Status};

/// Kind of interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptType {
    /// Abort one node, or the whole plan when no node is given
    Abort,
    AbortAll,
    Pause,
    Resume,
    /// Retry a node held for manual intervention
    Retry,
    MarkExpired,
    MarkSuccess,
    MarkFailed,
}

impl InterruptType {
    /// Interrupts that need a node execution to act on.
    pub fn requires_node(self) -> bool {
        matches!(
            self,
            InterruptType::Retry
                | InterruptType::MarkExpired
                | InterruptType::MarkSuccess
                | InterruptType::MarkFailed
        )
    }
}

impl fmt::Display for InterruptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InterruptType::Abort => "ABORT",
            InterruptType::AbortAll => "ABORT_ALL",
            InterruptType::Pause => "PAUSE",
            InterruptType::Resume => "RESUME",
            InterruptType::Retry => "RETRY",
            InterruptType::MarkExpired => "MARK_EXPIRED",
            InterruptType::MarkSuccess => "MARK_SUCCESS",
            InterruptType::MarkFailed => "MARK_FAILED",
        };
        write!(f, "{}", name)
    }
}

/// Lifecycle of a registered interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InterruptState {
    Registered,
    Processed,
    Discarded,
}

/// What a caller submits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptPackage {
    pub plan_execution_id: String,
    #[serde(default)]
    pub node_execution_id: Option<String>,
    pub interrupt_type: InterruptType,
    #[serde(default)]
    pub metadata: Value,
}

impl InterruptPackage {
    /// Interrupt against the whole plan.
    pub fn for_plan(plan_execution_id: impl Into<String>, interrupt_type: InterruptType) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            node_execution_id: None,
            interrupt_type,
            metadata: Value::Null,
        }
    }

    /// Interrupt against one node.
    pub fn for_node(
        plan_execution_id: impl Into<String>,
        node_execution_id: impl Into<String>,
        interrupt_type: InterruptType,
    ) -> Self {
        Self {
            node_execution_id: Some(node_execution_id.into()),
            ..Self::for_plan(plan_execution_id, interrupt_type)
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A registered interrupt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    pub id: String,
    pub plan_execution_id: String,
    #[serde(default)]
    pub node_execution_id: Option<String>,
    pub interrupt_type: InterruptType,
    #[serde(default)]
    pub metadata: Value,
    pub state: InterruptState,
    pub created_at: DateTime<Utc>,
}

impl Interrupt {
    pub fn new(package: InterruptPackage) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            plan_execution_id: package.plan_execution_id,
            node_execution_id: package.node_execution_id,
            interrupt_type: package.interrupt_type,
            metadata: package.metadata,
            state: InterruptState::Registered,
            created_at: Utc::now(),
        }
    }
}

/// Statuses from which a node can be concluded by an interrupt.
const LIVE: &[Status] = &[
    Status::Queued,
    Status::Running,
    Status::AsyncWaiting,
    Status::InterventionWaiting,
    Status::Paused,
];

impl EngineInner {
    /// Applies an interrupt and records its final state.
    pub(crate) fn process_interrupt(&self, interrupt: &Interrupt) -> Result<InterruptState> {
        let outcome = self.apply_interrupt(interrupt)?;
        let state = if outcome {
            InterruptState::Processed
        } else {
            InterruptState::Discarded
        };

        self.store.update_interrupt_state(&interrupt.id, state)?;
        info!(
            "Interrupt {} ({}) on plan {}: {:?}",
            interrupt.id, interrupt.interrupt_type, interrupt.plan_execution_id, state
        );
        Ok(state)
    }

    /// Returns false when the interrupt had nothing to act on.
    fn apply_interrupt(&self, interrupt: &Interrupt) -> Result<bool> {
        let plan_id = interrupt.plan_execution_id.as_str();
        let node_id = interrupt.node_execution_id.as_deref();

        match (interrupt.interrupt_type, node_id) {
            (InterruptType::Abort, Some(node_id)) => self.abort_node(node_id),
            (InterruptType::Abort, None) | (InterruptType::AbortAll, _) => self.abort_plan(plan_id),
            (InterruptType::Pause, _) => self.pause_plan(plan_id),
            (InterruptType::Resume, _) => self.resume_plan(plan_id),
            (InterruptType::Retry, Some(node_id)) => self.retry_intervention(node_id),
            (InterruptType::MarkSuccess, Some(node_id)) => {
                self.mark_node(node_id, Status::Succeeded, AdviseKind::Proceed)
            }
            (InterruptType::MarkFailed, Some(node_id)) => {
                self.mark_node(node_id, Status::Failed, AdviseKind::MarkFailed)
            }
            (InterruptType::MarkExpired, Some(node_id)) => {
                self.mark_node(node_id, Status::Expired, AdviseKind::MarkFailed)
            }
            (interrupt_type, None) => Err(EngineError::InvalidInterrupt(format!(
                "{} requires a node execution id",
                interrupt_type
            ))),
        }
    }

    fn abort_node(&self, node_id: &str) -> Result<bool> {
        let node = self.store.get_node_execution(node_id)?;
        if node.status.is_terminal() {
            return Ok(false);
        }

        self.abort_descendants(node_id)?;
        let failure = FailureInfo::new("Aborted by interrupt", vec![FailureType::Aborted]);
        let aborted = self.transition_node(node_id, LIVE, Status::Aborted, |n| {
            n.failure_info = Some(failure.clone());
            n.advise = Some(AdviseKind::MarkFailed);
        })?;

        match aborted {
            Some(aborted) => {
                self.notify.cancel(&aborted.id);
                self.apply_advise(&aborted, Advise::mark_failed())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn abort_plan(&self, plan_id: &str) -> Result<bool> {
        let flagged = self.update_plan(plan_id, |p| {
            if p.status.is_terminal() || p.abort_requested {
                return false;
            }
            p.abort_requested = true;
            true
        })?;
        if flagged.is_none() {
            return Ok(false);
        }

        let aborted = self.abort_live_nodes(plan_id, "Plan aborted")?;
        debug!("ABORT_ALL aborted {} node(s) of plan {}", aborted, plan_id);
        self.finalize_plan(plan_id)?;
        Ok(true)
    }

    fn pause_plan(&self, plan_id: &str) -> Result<bool> {
        let paused = self.transition_plan(plan_id, &[Status::Queued, Status::Running], Status::Paused)?;
        if paused.is_none() {
            return Ok(false);
        }

        for node in self.store.find_node_executions_for_plan(plan_id)? {
            if node.status == Status::Queued {
                self.transition_node(&node.id, &[Status::Queued], Status::Paused, |_| {})?;
            }
        }
        Ok(true)
    }

    fn resume_plan(&self, plan_id: &str) -> Result<bool> {
        let resumed = {
            // Taken before the status flip so deferred resumptions are not stranded.
            let mut deferred = self.deferred.lock();
            let resumed = self.transition_plan(plan_id, &[Status::Paused], Status::Running)?;
            if resumed.is_some() {
                deferred.remove(plan_id).unwrap_or_default()
            } else {
                return Ok(false);
            }
        };

        for node in self.store.find_node_executions_for_plan(plan_id)? {
            if node.status == Status::Paused {
                if let Some(requeued) = self.transition_node(&node.id, &[Status::Paused], Status::Queued, |_| {})? {
                    self.submit_start(&requeued.id, false)?;
                }
            }
        }

        for resume in resumed {
            self.submit_resume(resume)?;
        }
        Ok(true)
    }

    fn retry_intervention(&self, node_id: &str) -> Result<bool> {
        let held = self.transition_node_with(
            node_id,
            &[Status::InterventionWaiting],
            |n| n.intervention_status.unwrap_or(Status::Failed),
            |n| n.advise = Some(AdviseKind::Retry),
        )?;

        match held {
            Some(node) => {
                self.apply_advise(&node, Advise::retry(std::time::Duration::ZERO))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn mark_node(&self, node_id: &str, status: Status, advise: AdviseKind) -> Result<bool> {
        let node = self.store.get_node_execution(node_id)?;
        if node.status.is_terminal() {
            return Ok(false);
        }

        // Waiting, queued and paused nodes are claimed first so a racing
        // resume or start loses the version check.
        if matches!(node.status, Status::Queued | Status::AsyncWaiting | Status::Paused) {
            let claimed = self.transition_node(node_id, &[node.status], Status::Running, |_| {})?;
            if claimed.is_none() {
                return Ok(false);
            }
            self.notify.cancel(node_id);
        }

        self.abort_descendants(node_id)?;
        let failure = failure_for_mark(status);
        let marked = self.transition_node(
            node_id,
            &[Status::Running, Status::InterventionWaiting],
            status,
            |n| {
                n.failure_info = failure.clone();
                n.advise = Some(advise);
            },
        )?;

        match marked {
            Some(marked) => {
                self.apply_advise(&marked, Advise::of(advise))?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Aborts every live node below `node_id` without concluding their chains.
    pub(crate) fn abort_descendants(&self, node_id: &str) -> Result<usize> {
        let mut aborted = 0;
        for child in self.store.find_children(node_id)? {
            aborted += self.abort_descendants(&child.id)?;
            if self.abort_quietly(&child, "Parent was interrupted")? {
                aborted += 1;
            }
        }
        Ok(aborted)
    }

    /// Aborts a node without running its advisers.
    pub(crate) fn abort_quietly(&self, node: &NodeExecution, reason: &str) -> Result<bool> {
        if node.status.is_terminal() {
            return Ok(false);
        }
        let failure = FailureInfo::new(reason, vec![FailureType::Aborted]);
        let aborted = self.transition_node(&node.id, LIVE, Status::Aborted, |n| {
            n.failure_info = Some(failure.clone());
        })?;
        if aborted.is_some() {
            self.notify.cancel(&node.id);
        }
        Ok(aborted.is_some())
    }
}

fn failure_for_mark(status: Status) -> Option<FailureInfo> {
    match status {
        Status::Failed => Some(FailureInfo::new("Marked failed by interrupt", vec![FailureType::Unknown])),
        Status::Expired => Some(FailureInfo::new("Marked expired by interrupt", vec![FailureType::Expired])),
        _ => None,
    }
}
