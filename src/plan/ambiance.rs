//! Execution Ambiance
//!
//! The immutable context snapshot threaded through every engine call. It
//! carries the nesting stack (plan -> section -> step), the owning plan
//! execution and scoping metadata such as account/org/project.
//!
//! An ambiance is never mutated in place. Entering or leaving a level derives
//! a new value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One entry in the nesting stack.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Level {
    /// Runtime id of the node execution at this level
    pub runtime_id: String,
    /// Plan node id this level was created from
    pub setup_id: String,
    /// Human-readable identifier of the plan node
    pub identifier: String,
    /// Step type of the plan node
    pub step_type: String,
    /// Optional grouping (e.g. "STAGE", "STEP_GROUP")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

/// Immutable execution context.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Ambiance {
    pub plan_execution_id: String,
    #[serde(default)]
    pub levels: Vec<Level>,
    #[serde(default)]
    pub setup_abstractions: BTreeMap<String, String>,
    /// Token scoping secret/expression resolution to one execution.
    pub expression_functor_token: i64,
}

impl Ambiance {
    /// Creates the root ambiance of a plan execution (no levels).
    pub fn new(
        plan_execution_id: impl Into<String>,
        setup_abstractions: BTreeMap<String, String>,
        expression_functor_token: i64,
    ) -> Self {
        Self {
            plan_execution_id: plan_execution_id.into(),
            levels: Vec::new(),
            setup_abstractions,
            expression_functor_token,
        }
    }

    /// Returns a copy with `level` pushed on top of the stack.
    pub fn with_level(&self, level: Level) -> Self {
        let mut derived = self.clone();
        derived.levels.push(level);
        derived
    }

    /// Returns a copy with the innermost level removed.
    pub fn without_last_level(&self) -> Self {
        let mut derived = self.clone();
        derived.levels.pop();
        derived
    }

    /// Returns a copy where the innermost level is swapped for `level`.
    ///
    /// Used when moving to a same-level successor.
    pub fn with_replaced_level(&self, level: Level) -> Self {
        self.without_last_level().with_level(level)
    }

    /// The innermost level, if any.
    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    /// Runtime id of the innermost level.
    pub fn current_runtime_id(&self) -> Option<&str> {
        self.current_level().map(|l| l.runtime_id.as_str())
    }

    /// Nesting depth.
    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn setup_abstraction(&self, key: &str) -> Option<&str> {
        self.setup_abstractions.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(id: &str) -> Level {
        Level {
            runtime_id: format!("rt-{}", id),
            setup_id: id.to_string(),
            identifier: id.to_string(),
            step_type: "Noop".to_string(),
            group: None,
        }
    }

    fn root() -> Ambiance {
        let mut abstractions = BTreeMap::new();
        abstractions.insert("accountId".to_string(), "acc-1".to_string());
        Ambiance::new("plan-1", abstractions, 42)
    }

    #[test]
    fn test_root_has_no_levels() {
        let ambiance = root();
        assert_eq!(ambiance.depth(), 0);
        assert!(ambiance.current_level().is_none());
        assert_eq!(ambiance.setup_abstraction("accountId"), Some("acc-1"));
    }

    #[test]
    fn test_with_level_does_not_mutate_original() {
        let ambiance = root();
        let child = ambiance.with_level(level("stage"));

        assert_eq!(ambiance.depth(), 0);
        assert_eq!(child.depth(), 1);
        assert_eq!(child.current_runtime_id(), Some("rt-stage"));
        assert_eq!(child.plan_execution_id, "plan-1");
        assert_eq!(child.expression_functor_token, 42);
    }

    #[test]
    fn test_replace_and_pop_levels() {
        let nested = root().with_level(level("stage")).with_level(level("a"));
        let sibling = nested.with_replaced_level(level("b"));

        assert_eq!(sibling.depth(), 2);
        assert_eq!(sibling.levels[0].identifier, "stage");
        assert_eq!(sibling.current_level().unwrap().identifier, "b");

        let parent = sibling.without_last_level();
        assert_eq!(parent.current_level().unwrap().identifier, "stage");
    }
}
