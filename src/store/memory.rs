//! In-Memory Execution Store
//!
//! A [`ExecutionStore`] backed by hash maps behind `parking_lot` locks.
//! Every record remembers its insertion sequence so range queries come back
//! in creation order.

use std::collections::HashMap;

use log::debug;
use parking_lot::RwLock;

use super::ExecutionStore;
use crate::error::StoreError;
use crate::execution::{NodeExecution, PlanExecution, Status};
use crate::orchestration::interrupt::{Interrupt, InterruptState};

#[derive(Debug, Clone)]
struct Stored<T> {
    seq: u64,
    record: T,
}

#[derive(Debug, Default)]
struct Tables {
    next_seq: u64,
    plans: HashMap<String, Stored<PlanExecution>>,
    nodes: HashMap<String, Stored<NodeExecution>>,
    interrupts: HashMap<String, Stored<Interrupt>>,
}

impl Tables {
    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Collects matching records sorted by insertion order.
fn ordered<T: Clone>(
    table: &HashMap<String, Stored<T>>,
    mut filter: impl FnMut(&T) -> bool,
) -> Vec<T> {
    let mut matching: Vec<&Stored<T>> = table.values().filter(|s| filter(&s.record)).collect();
    matching.sort_by_key(|s| s.seq);
    matching.into_iter().map(|s| s.record.clone()).collect()
}

/// Thread-safe in-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store pre-populated with records, e.g. from a snapshot.
    pub fn from_records(
        plans: Vec<PlanExecution>,
        nodes: Vec<NodeExecution>,
        interrupts: Vec<Interrupt>,
    ) -> Self {
        let store = Self::new();
        {
            let mut tables = store.tables.write();
            for record in plans {
                let seq = tables.seq();
                tables.plans.insert(record.id.clone(), Stored { seq, record });
            }
            for record in nodes {
                let seq = tables.seq();
                tables.nodes.insert(record.id.clone(), Stored { seq, record });
            }
            for record in interrupts {
                let seq = tables.seq();
                tables.interrupts.insert(record.id.clone(), Stored { seq, record });
            }
        }
        store
    }

    /// All records, in insertion order.
    pub fn records(&self) -> (Vec<PlanExecution>, Vec<NodeExecution>, Vec<Interrupt>) {
        let tables = self.tables.read();
        (
            ordered(&tables.plans, |_| true),
            ordered(&tables.nodes, |_| true),
            ordered(&tables.interrupts, |_| true),
        )
    }

    pub fn node_count(&self) -> usize {
        self.tables.read().nodes.len()
    }
}

impl ExecutionStore for MemoryStore {
    fn insert_plan_execution(&self, execution: PlanExecution) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if tables.plans.contains_key(&execution.id) {
            return Err(StoreError::Duplicate {
                kind: "plan execution",
                id: execution.id,
            });
        }
        let seq = tables.seq();
        tables
            .plans
            .insert(execution.id.clone(), Stored { seq, record: execution });
        Ok(())
    }

    fn get_plan_execution(&self, id: &str) -> Result<PlanExecution, StoreError> {
        self.tables
            .read()
            .plans
            .get(id)
            .map(|s| s.record.clone())
            .ok_or_else(|| StoreError::NotFound {
                kind: "plan execution",
                id: id.to_string(),
            })
    }

    fn update_plan_execution(
        &self,
        id: &str,
        expected_version: u64,
        update: &mut dyn FnMut(&mut PlanExecution),
    ) -> Result<PlanExecution, StoreError> {
        let mut tables = self.tables.write();
        let stored = tables.plans.get_mut(id).ok_or_else(|| StoreError::NotFound {
            kind: "plan execution",
            id: id.to_string(),
        })?;

        if stored.record.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
                actual: stored.record.version,
            });
        }

        update(&mut stored.record);
        stored.record.version = expected_version + 1;
        Ok(stored.record.clone())
    }

    fn find_plan_executions_by_status(&self, statuses: &[Status]) -> Result<Vec<PlanExecution>, StoreError> {
        let tables = self.tables.read();
        Ok(ordered(&tables.plans, |p| statuses.contains(&p.status)))
    }

    fn insert_node_execution(&self, execution: NodeExecution) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if tables.nodes.contains_key(&execution.id) {
            return Err(StoreError::Duplicate {
                kind: "node execution",
                id: execution.id,
            });
        }
        debug!(
            "Stored node execution {} ({}) for plan {}",
            execution.id, execution.identifier, execution.plan_execution_id
        );
        let seq = tables.seq();
        tables
            .nodes
            .insert(execution.id.clone(), Stored { seq, record: execution });
        Ok(())
    }

    fn get_node_execution(&self, id: &str) -> Result<NodeExecution, StoreError> {
        self.tables
            .read()
            .nodes
            .get(id)
            .map(|s| s.record.clone())
            .ok_or_else(|| StoreError::NotFound {
                kind: "node execution",
                id: id.to_string(),
            })
    }

    fn update_node_execution(
        &self,
        id: &str,
        expected_version: u64,
        update: &mut dyn FnMut(&mut NodeExecution),
    ) -> Result<NodeExecution, StoreError> {
        let mut tables = self.tables.write();
        let stored = tables.nodes.get_mut(id).ok_or_else(|| StoreError::NotFound {
            kind: "node execution",
            id: id.to_string(),
        })?;

        if stored.record.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: id.to_string(),
                expected: expected_version,
                actual: stored.record.version,
            });
        }

        update(&mut stored.record);
        stored.record.version = expected_version + 1;
        Ok(stored.record.clone())
    }

    fn find_node_executions_by_status(&self, statuses: &[Status]) -> Result<Vec<NodeExecution>, StoreError> {
        let tables = self.tables.read();
        Ok(ordered(&tables.nodes, |n| statuses.contains(&n.status)))
    }

    fn find_node_executions_for_plan(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>, StoreError> {
        let tables = self.tables.read();
        Ok(ordered(&tables.nodes, |n| n.plan_execution_id == plan_execution_id))
    }

    fn find_children(&self, parent_id: &str) -> Result<Vec<NodeExecution>, StoreError> {
        let tables = self.tables.read();
        Ok(ordered(&tables.nodes, |n| n.parent_id.as_deref() == Some(parent_id)))
    }

    fn save_interrupt(&self, interrupt: Interrupt) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        if tables.interrupts.contains_key(&interrupt.id) {
            return Err(StoreError::Duplicate {
                kind: "interrupt",
                id: interrupt.id,
            });
        }
        let seq = tables.seq();
        tables
            .interrupts
            .insert(interrupt.id.clone(), Stored { seq, record: interrupt });
        Ok(())
    }

    fn update_interrupt_state(&self, id: &str, state: InterruptState) -> Result<Interrupt, StoreError> {
        let mut tables = self.tables.write();
        let stored = tables.interrupts.get_mut(id).ok_or_else(|| StoreError::NotFound {
            kind: "interrupt",
            id: id.to_string(),
        })?;
        stored.record.state = state;
        Ok(stored.record.clone())
    }

    fn find_interrupts_for_plan(&self, plan_execution_id: &str) -> Result<Vec<Interrupt>, StoreError> {
        let tables = self.tables.read();
        Ok(ordered(&tables.interrupts, |i| i.plan_execution_id == plan_execution_id))
    }
}
