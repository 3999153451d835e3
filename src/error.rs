//! Error Types
//!
//! Errors surfaced by the orchestration engine and its collaborators.
//!
//! Step-level failures never escape as errors: they are folded into a
//! FAILED node status carrying a [`FailureInfo`](crate::execution::FailureInfo).
//! What remains here is either a caller mistake (bad plan, unknown id) or an
//! engine invariant violation that points at a bug.

use thiserror::Error;

use crate::execution::{FailureType, Status};

/// Result type used by engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors returned by the persistence collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} '{id}' already exists")]
    Duplicate { kind: &'static str, id: String },

    /// The record changed since it was read.
    #[error("version conflict on '{id}': expected {expected}, found {actual}")]
    VersionConflict { id: String, expected: u64, actual: u64 },

    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while loading or validating a plan.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("failed to read plan file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse plan: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("{}", .0.join("\n"))]
    Invalid(Vec<String>),
}

/// Errors raised by a step while it executes.
///
/// Both variants are recovered by the engine into a FAILED status and routed
/// through the node's advisers.
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// Handing work to the dispatch collaborator failed; usually worth a retry.
    #[error("task dispatch failed: {0}")]
    TransientDispatchFailure(String),

    #[error("{message}")]
    StepExecutionFailure {
        message: String,
        failure_types: Vec<FailureType>,
    },
}

impl StepError {
    /// Builds a business failure with a single failure category.
    pub fn failure(message: impl Into<String>, failure_type: FailureType) -> Self {
        Self::StepExecutionFailure {
            message: message.into(),
            failure_types: vec![failure_type],
        }
    }

    /// Failure categories reported for this error.
    pub fn failure_types(&self) -> Vec<FailureType> {
        match self {
            Self::TransientDispatchFailure(_) => vec![FailureType::Connectivity],
            Self::StepExecutionFailure { failure_types, .. } => failure_types.clone(),
        }
    }
}

/// Errors returned by the orchestration engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid plan: {0}")]
    InvalidPlan(#[from] PlanError),

    #[error("plan execution '{0}' not found")]
    PlanExecutionNotFound(String),

    #[error("node execution '{0}' not found")]
    NodeExecutionNotFound(String),

    #[error("step type '{0}' is not registered")]
    UnknownStepType(String),

    /// An attempted status change the state machine does not allow.
    ///
    /// This is the engine invariant violation: it indicates a data race or a
    /// logic bug, so it is reported and never retried.
    #[error("invalid transition for '{id}': {from} -> {to}")]
    InvalidTransition { id: String, from: Status, to: Status },

    #[error("plan execution '{0}' has already finished")]
    PlanFinished(String),

    #[error("invalid interrupt: {0}")]
    InvalidInterrupt(String),

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind: "node execution", id } => Self::NodeExecutionNotFound(id),
            StoreError::NotFound { kind: "plan execution", id } => Self::PlanExecutionNotFound(id),
            other => Self::Store(other),
        }
    }
}

impl EngineError {
    /// Returns true for errors that indicate an engine bug rather than a
    /// domain failure.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }
}

/// Errors returned by the resource restraint service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RestraintError {
    #[error("resource restraint '{0}' not found")]
    RestraintNotFound(String),

    #[error("resource restraint named '{0}' already exists")]
    DuplicateRestraint(String),

    #[error("restraint instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("requested {requested} permits but '{restraint}' has capacity {capacity}")]
    PermitsExceedCapacity {
        restraint: String,
        requested: u32,
        capacity: u32,
    },

    #[error("permits must be at least 1")]
    ZeroPermits,
}
