//! Plan Validation
//!
//! Structural checks run before a plan may be executed:
//! - Node field validation
//! - Reference integrity (no dangling `next`/`children`/`start`)
//! - Single ownership (a node is the successor or child of at most one node)
//! - Cycle detection over the combined `next` + `children` edges

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use log::{debug, info};

use super::model::{Plan, PlanNode};
use crate::error::PlanError;

/// Validation error types for user-friendly error messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    EmptyPlan,
    DuplicateNodeId(String),
    EmptyNodeId,
    EmptyStepType(String),
    MissingStart(String),
    InvalidReference { node: String, reference: String },
    MultipleOwners { node: String, owners: Vec<String> },
    StartHasOwner { start: String, owner: String },
    CyclicReference,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyPlan => write!(f, "Plan has no nodes"),
            Self::DuplicateNodeId(id) => write!(f, "Duplicate node ID: '{}'", id),
            Self::EmptyNodeId => write!(f, "Node has empty or whitespace-only ID"),
            Self::EmptyStepType(node) => write!(f, "Node '{}' has no step type", node),
            Self::MissingStart(start) => write!(f, "Start node '{}' does not exist", start),
            Self::InvalidReference { node, reference } => {
                write!(f, "Node '{}' references unknown node '{}'", node, reference)
            }
            Self::MultipleOwners { node, owners } => {
                write!(f, "Node '{}' is referenced by several nodes: {}", node, owners.join(", "))
            }
            Self::StartHasOwner { start, owner } => {
                write!(f, "Start node '{}' is referenced by '{}'", start, owner)
            }
            Self::CyclicReference => write!(f, "Plan contains a reference cycle"),
        }
    }
}

/// Validates a single node's fields.
fn validate_node(node: &PlanNode) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if node.id.trim().is_empty() {
        errors.push(ValidationError::EmptyNodeId);
        return errors;
    }

    if node.step_type.trim().is_empty() {
        errors.push(ValidationError::EmptyStepType(node.id.clone()));
    }

    if node.next.is_none() && node.children.is_empty() {
        debug!("Node '{}' ends its chain", node.id);
    }

    errors
}

/// Validates the entire plan structure.
///
/// Collects every field and reference problem before giving up, so a caller
/// sees all of them at once.
pub fn validate_plan(plan: &Plan) -> Result<(), PlanError> {
    info!("Validating plan '{}' with {} nodes", plan.id, plan.nodes.len());

    if plan.nodes.is_empty() {
        return Err(PlanError::Invalid(vec![ValidationError::EmptyPlan.to_string()]));
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for node in &plan.nodes {
        if !seen_ids.insert(node.id.as_str()) {
            return Err(PlanError::Invalid(vec![
                ValidationError::DuplicateNodeId(node.id.clone()).to_string()
            ]));
        }
    }

    let mut all_errors = Vec::new();

    if !seen_ids.contains(plan.start.as_str()) {
        all_errors.push(ValidationError::MissingStart(plan.start.clone()));
    }

    let mut owners: HashMap<&str, Vec<String>> = HashMap::new();
    for node in &plan.nodes {
        all_errors.extend(validate_node(node));

        for reference in node.references() {
            if !seen_ids.contains(reference.as_str()) {
                all_errors.push(ValidationError::InvalidReference {
                    node: node.id.clone(),
                    reference: reference.clone(),
                });
            } else {
                owners.entry(reference.as_str()).or_default().push(node.id.clone());
            }
        }
    }

    let mut owned: Vec<_> = owners.into_iter().collect();
    owned.sort();
    for (node, node_owners) in owned {
        if node == plan.start {
            all_errors.push(ValidationError::StartHasOwner {
                start: node.to_string(),
                owner: node_owners[0].clone(),
            });
        } else if node_owners.len() > 1 {
            all_errors.push(ValidationError::MultipleOwners {
                node: node.to_string(),
                owners: node_owners,
            });
        }
    }

    if !all_errors.is_empty() {
        return Err(PlanError::Invalid(
            all_errors.iter().map(|e| e.to_string()).collect(),
        ));
    }

    detect_cycles(plan)?;

    info!("Plan '{}' validated: {} nodes", plan.id, plan.nodes.len());
    Ok(())
}

/// Detects cycles using Kahn's algorithm over `next` and `children` edges.
fn detect_cycles(plan: &Plan) -> Result<(), PlanError> {
    let mut in_degree: HashMap<&str, usize> =
        plan.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();

    for node in &plan.nodes {
        for reference in node.references() {
            if let Some(degree) = in_degree.get_mut(reference.as_str()) {
                *degree += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut visited = 0;
    while let Some(current) = queue.pop_front() {
        visited += 1;

        let Some(node) = plan.node(current) else {
            continue;
        };
        for reference in node.references() {
            if let Some(degree) = in_degree.get_mut(reference.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(reference.as_str());
                }
            }
        }
    }

    if visited != plan.nodes.len() {
        return Err(PlanError::Invalid(vec![ValidationError::CyclicReference.to_string()]));
    }

    Ok(())
}

/// Node ids not reachable from the start node.
///
/// Unreachable nodes are legal but never run; the parser logs them.
pub fn unreachable_nodes(plan: &Plan) -> Vec<String> {
    let mut reachable: HashSet<&str> = HashSet::new();
    let mut stack = vec![plan.start.as_str()];

    while let Some(id) = stack.pop() {
        if !reachable.insert(id) {
            continue;
        }
        if let Some(node) = plan.node(id) {
            stack.extend(node.references().map(String::as_str));
        }
    }

    plan.nodes
        .iter()
        .filter(|n| !reachable.contains(n.id.as_str()))
        .map(|n| n.id.clone())
        .collect()
}
