//! Execution Status
//!
//! The status state machine shared by node and plan executions.
//!
//! ```text
//! QUEUED ──► RUNNING ──► SUCCEEDED | FAILED | ABORTED | EXPIRED | SKIPPED
//!   │          │  ▲
//!   │          │  └── ASYNC_WAITING ◄── (dispatched task)
//!   │          └───► INTERVENTION_WAITING ──► terminal
//!   └──► PAUSED ◄──┘ (interrupts)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of a node or plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Created, waiting for a worker
    Queued,
    /// Being advanced by the engine
    Running,
    /// Suspended on dispatched external work
    AsyncWaiting,
    /// Held for a manual decision (MARK_* / RETRY / ABORT interrupt)
    InterventionWaiting,
    /// Frozen by a PAUSE interrupt
    Paused,
    Succeeded,
    Failed,
    Aborted,
    Expired,
    Skipped,
}

impl Status {
    /// Every status, in declaration order.
    pub const ALL: [Status; 10] = [
        Status::Queued,
        Status::Running,
        Status::AsyncWaiting,
        Status::InterventionWaiting,
        Status::Paused,
        Status::Succeeded,
        Status::Failed,
        Status::Aborted,
        Status::Expired,
        Status::Skipped,
    ];

    /// Statuses that can never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::Succeeded | Status::Failed | Status::Aborted | Status::Expired | Status::Skipped
        )
    }

    /// Terminal statuses that count as a failure of the node.
    pub fn is_failure(self) -> bool {
        matches!(self, Status::Failed | Status::Aborted | Status::Expired)
    }

    /// Suspended statuses that hold no worker thread.
    pub fn is_waiting(self) -> bool {
        matches!(self, Status::AsyncWaiting | Status::InterventionWaiting)
    }

    /// Returns true if the state machine allows `self -> next`.
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;

        match self {
            Queued => matches!(next, Running | Paused | Skipped | Aborted | Failed),
            Running => matches!(
                next,
                AsyncWaiting
                    | InterventionWaiting
                    | Paused
                    | Succeeded
                    | Failed
                    | Aborted
                    | Expired
                    | Skipped
            ),
            AsyncWaiting => matches!(next, Running | Expired | Aborted),
            InterventionWaiting => matches!(next, Succeeded | Failed | Aborted | Expired),
            // A paused plan still finalises when its last running node ends.
            Paused => matches!(next, Queued | Running | Aborted | Succeeded | Failed | Expired),
            Succeeded | Failed | Aborted | Expired | Skipped => false,
        }
    }

    /// Folds the statuses of finished executions into one outcome.
    ///
    /// Failure dominates: FAILED > EXPIRED > ABORTED > SUCCEEDED. Skipped
    /// executions count as success. An empty input is a success.
    pub fn aggregate<I>(statuses: I) -> Status
    where
        I: IntoIterator<Item = Status>,
    {
        let mut result = Status::Succeeded;

        for status in statuses {
            let rank = |s: Status| match s {
                Status::Failed => 3,
                Status::Expired => 2,
                Status::Aborted => 1,
                _ => 0,
            };
            if rank(status) > rank(result) {
                result = status;
            }
        }

        result
    }

    /// Upper-case wire name of the status.
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::AsyncWaiting => "ASYNC_WAITING",
            Status::InterventionWaiting => "INTERVENTION_WAITING",
            Status::Paused => "PAUSED",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Aborted => "ABORTED",
            Status::Expired => "EXPIRED",
            Status::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        let terminal: Vec<_> = Status::ALL.iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(terminal.len(), 5);
        assert!(!Status::Paused.is_terminal());
        assert!(!Status::AsyncWaiting.is_terminal());
    }

    #[test]
    fn test_terminal_never_transitions() {
        for from in Status::ALL.iter().filter(|s| s.is_terminal()) {
            for to in Status::ALL {
                assert!(!from.can_transition_to(to), "{} -> {} must be rejected", from, to);
            }
        }
    }

    #[test]
    fn test_waiting_cycle() {
        assert!(Status::Running.can_transition_to(Status::AsyncWaiting));
        assert!(Status::AsyncWaiting.can_transition_to(Status::Running));
        assert!(Status::AsyncWaiting.can_transition_to(Status::Expired));
        assert!(!Status::AsyncWaiting.can_transition_to(Status::Succeeded));
    }

    #[test]
    fn test_pause_cycle() {
        assert!(Status::Running.can_transition_to(Status::Paused));
        assert!(Status::Paused.can_transition_to(Status::Running));
        assert!(Status::Paused.can_transition_to(Status::Aborted));
        assert!(Status::Queued.can_transition_to(Status::Paused));
        assert!(Status::Paused.can_transition_to(Status::Queued));
    }

    #[test]
    fn test_queued_cannot_jump_to_success() {
        assert!(!Status::Queued.can_transition_to(Status::Succeeded));
        assert!(Status::Queued.can_transition_to(Status::Skipped));
    }

    #[test]
    fn test_aggregate_priority() {
        assert_eq!(Status::aggregate(Vec::new()), Status::Succeeded);
        assert_eq!(
            Status::aggregate([Status::Succeeded, Status::Skipped]),
            Status::Succeeded
        );
        assert_eq!(
            Status::aggregate([Status::Aborted, Status::Failed, Status::Succeeded]),
            Status::Failed
        );
        assert_eq!(
            Status::aggregate([Status::Aborted, Status::Expired]),
            Status::Expired
        );
        assert_eq!(Status::aggregate([Status::Aborted]), Status::Aborted);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&Status::InterventionWaiting).unwrap();
        assert_eq!(json, "\"INTERVENTION_WAITING\"");
        let parsed: Status = serde_json::from_str("\"ASYNC_WAITING\"").unwrap();
        assert_eq!(parsed, Status::AsyncWaiting);
        assert_eq!(Status::Failed.to_string(), "FAILED");
    }
}
