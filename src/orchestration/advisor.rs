//! Advisers
//!
//! Once a node reaches a terminal outcome, its advisers decide what happens
//! next. Advisers are tried in order (node-level first, then the step type's
//! defaults) and the first one whose trigger matches wins.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::execution::{FailureType, Status};
use crate::plan::{AdviserConfig, AdviserKind, RepairAction};

/// The decision an adviser makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdviseKind {
    /// Continue with the same-level successor, or end the chain
    Proceed,
    /// Supersede this attempt with a fresh one
    Retry,
    /// End the chain with the failure
    MarkFailed,
    /// Abort everything still running and finish the plan
    EndPlan,
    /// Hold the node until an operator decides
    InterveneManual,
}

/// An advise plus its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advise {
    pub kind: AdviseKind,
    /// Backoff before the retried attempt starts
    pub wait: Duration,
    /// How long a manual intervention may wait before expiring
    pub timeout: Option<Duration>,
}

impl Advise {
    pub fn of(kind: AdviseKind) -> Self {
        Self {
            kind,
            wait: Duration::ZERO,
            timeout: None,
        }
    }

    pub fn proceed() -> Self {
        Self::of(AdviseKind::Proceed)
    }

    pub fn retry(wait: Duration) -> Self {
        Self {
            wait,
            ..Self::of(AdviseKind::Retry)
        }
    }

    pub fn mark_failed() -> Self {
        Self::of(AdviseKind::MarkFailed)
    }

    pub fn end_plan() -> Self {
        Self::of(AdviseKind::EndPlan)
    }

    pub fn intervene_manual(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            ..Self::of(AdviseKind::InterveneManual)
        }
    }

    /// Advise applied when no adviser matches.
    pub fn default_for(status: Status) -> Self {
        if status.is_failure() {
            Self::mark_failed()
        } else {
            Self::proceed()
        }
    }

    fn from_repair(action: RepairAction) -> Self {
        match action {
            RepairAction::MarkFailed => Self::mark_failed(),
            RepairAction::EndPlan => Self::end_plan(),
            RepairAction::Ignore => Self::proceed(),
            RepairAction::ManualIntervention => Self::intervene_manual(None),
        }
    }
}

/// Picks the advise for a node that ended with `status`.
///
/// `retry_count` is the number of attempts already made before this one.
pub fn advise<'a, I>(status: Status, failure_types: &[FailureType], retry_count: usize, advisers: I) -> Advise
where
    I: IntoIterator<Item = &'a AdviserConfig>,
{
    for adviser in advisers {
        if !adviser.matches(status, failure_types) {
            continue;
        }

        return match &adviser.kind {
            AdviserKind::Retry {
                max_retries,
                wait_intervals_secs,
                on_exhausted,
            } => {
                if retry_count < *max_retries as usize {
                    let wait = wait_intervals_secs
                        .get(retry_count)
                        .or_else(|| wait_intervals_secs.last())
                        .copied()
                        .unwrap_or(0);
                    Advise::retry(Duration::from_secs(wait))
                } else {
                    Advise::from_repair(*on_exhausted)
                }
            }
            AdviserKind::ManualIntervention { timeout_secs } => {
                Advise::intervene_manual(timeout_secs.map(Duration::from_secs))
            }
            AdviserKind::Ignore => Advise::proceed(),
            AdviserKind::MarkFailed => Advise::mark_failed(),
            AdviserKind::EndPlan => Advise::end_plan(),
        };
    }

    Advise::default_for(status)
}
