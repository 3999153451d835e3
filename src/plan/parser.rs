//! Plan Parser
//!
//! Loads plan definitions from YAML files, fills derived fields and validates
//! the result before handing it to the engine.

use std::fs;

use log::{debug, info, warn};

use super::model::Plan;
use super::validator::{unreachable_nodes, validate_plan};
use crate::error::PlanError;

/// Loads a plan from a YAML file.
///
/// This function:
/// 1. Reads and parses the YAML file
/// 2. Defaults missing identifiers to node ids
/// 3. Validates references and detects cycles
///
/// # Example
///
/// ```rust,no_run
/// use planrunner::plan::load_plan;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let plan = load_plan("deploy.yaml")?;
///     println!("Loaded {} nodes", plan.nodes.len());
///     Ok(())
/// }
/// ```
pub fn load_plan(path: &str) -> Result<Plan, PlanError> {
    info!("Loading plan from: {}", path);

    let yaml_content = fs::read_to_string(path).map_err(|source| PlanError::Read {
        path: path.to_string(),
        source,
    })?;

    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    parse_plan(&yaml_content)
}

/// Parses and validates a plan from YAML text.
pub fn parse_plan(yaml_content: &str) -> Result<Plan, PlanError> {
    let mut plan: Plan = serde_yaml::from_str(yaml_content)?;
    plan.fill_identifiers();

    info!("Parsed plan '{}' with {} nodes", plan.id, plan.nodes.len());

    validate_plan(&plan)?;

    for orphan in unreachable_nodes(&plan) {
        warn!("Node '{}' is not reachable from '{}' and will never run", orphan, plan.start);
    }

    Ok(plan)
}
