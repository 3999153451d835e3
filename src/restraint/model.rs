//! Restraint Records
//!
//! A restraint is a named resource with a fixed number of permits. Every
//! request for permits becomes an instance, queued per resource unit in
//! arrival order.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which execution holds an instance, and so releases it when it ends.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldingScope {
    Plan,
    #[default]
    Node,
}

impl HoldingScope {
    /// Parses `PLAN` / `NODE`, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "PLAN" => Some(HoldingScope::Plan),
            "NODE" => Some(HoldingScope::Node),
            _ => None,
        }
    }
}

impl fmt::Display for HoldingScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HoldingScope::Plan => write!(f, "PLAN"),
            HoldingScope::Node => write!(f, "NODE"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    /// Queued behind older instances or short on capacity
    Blocked,
    /// Holding its permits
    Active,
    /// Permits returned
    Finished,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Blocked => "BLOCKED",
            InstanceState::Active => "ACTIVE",
            InstanceState::Finished => "FINISHED",
        };
        write!(f, "{}", s)
    }
}

/// A named resource with a permit capacity.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResourceRestraint {
    pub id: String,
    pub name: String,
    pub capacity: u32,
    pub created_at: DateTime<Utc>,
}

impl ResourceRestraint {
    pub fn new(name: impl Into<String>, capacity: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            capacity,
            created_at: Utc::now(),
        }
    }
}

/// One consumer's request for permits on a resource unit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RestraintInstance {
    pub id: String,
    pub restraint_id: String,
    /// Partition of the restraint, e.g. an environment name
    pub resource_unit: String,
    /// Plan or node execution that releases the instance
    pub release_entity_id: String,
    pub scope: HoldingScope,
    pub permits: u32,
    /// Arrival order; activation never overtakes a lower order
    pub order: u64,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
    pub acquired_at: Option<DateTime<Utc>>,
}

impl RestraintInstance {
    pub fn is_active(&self) -> bool {
        self.state == InstanceState::Active
    }
}
