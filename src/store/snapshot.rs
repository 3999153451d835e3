//! Store Snapshots
//!
//! Saves the full contents of a [`MemoryStore`] to a JSON file so a
//! restarted engine can pick up where it left off via
//! `OrchestrationEngine::recover`.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};

use super::MemoryStore;
use crate::error::StoreError;
use crate::execution::{NodeExecution, PlanExecution};
use crate::orchestration::interrupt::Interrupt;

/// Serialisable image of every record in a store.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct StoreSnapshot {
    pub taken_at: DateTime<Utc>,
    pub plan_executions: Vec<PlanExecution>,
    pub node_executions: Vec<NodeExecution>,
    #[serde(default)]
    pub interrupts: Vec<Interrupt>,
}

impl StoreSnapshot {
    /// Captures the current contents of `store`.
    pub fn capture(store: &MemoryStore) -> Self {
        let (plan_executions, node_executions, interrupts) = store.records();
        Self {
            taken_at: Utc::now(),
            plan_executions,
            node_executions,
            interrupts,
        }
    }

    /// Writes the snapshot as pretty JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;

        info!(
            "Saved store snapshot to {} ({} plans, {} nodes)",
            path.display(),
            self.plan_executions.len(),
            self.node_executions.len()
        );
        Ok(())
    }

    /// Reads a snapshot written by [`save`](Self::save).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let snapshot: StoreSnapshot = serde_json::from_str(&content)?;

        info!(
            "Loaded store snapshot from {} taken at {}",
            path.display(),
            snapshot.taken_at
        );
        Ok(snapshot)
    }

    /// Rebuilds a store holding the snapshot's records.
    pub fn into_store(self) -> MemoryStore {
        MemoryStore::from_records(self.plan_executions, self.node_executions, self.interrupts)
    }
}

impl MemoryStore {
    /// Shortcut for capturing and saving a snapshot.
    pub fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        StoreSnapshot::capture(self).save(path)
    }

    /// Shortcut for loading a snapshot into a new store.
    pub fn load_snapshot(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(StoreSnapshot::load(path)?.into_store())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::Status;
    use crate::plan::{Plan, PlanNode};
    use crate::store::ExecutionStore;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn populated_store() -> (MemoryStore, String, String) {
        let store = MemoryStore::new();
        let plan = Plan::from_nodes(
            "p",
            "a",
            vec![PlanNode::new("a", "Noop").with_next("b"), PlanNode::new("b", "Task")],
        );
        let execution = PlanExecution::new(Arc::new(plan), BTreeMap::new());
        let node = NodeExecution::new(
            &execution.id,
            execution.plan.node("b").unwrap(),
            &execution.root_ambiance(),
            None,
            None,
        );
        let ids = (execution.id.clone(), node.id.clone());
        store.insert_plan_execution(execution).unwrap();
        store.insert_node_execution(node).unwrap();
        store
            .update_node_execution(&ids.1, 0, &mut |n| {
                n.status = Status::AsyncWaiting;
                n.correlation_ids = vec!["cid-1".to_string()];
            })
            .unwrap();
        (store, ids.0, ids.1)
    }

    #[test]
    fn test_snapshot_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("store.json");
        let (store, plan_id, node_id) = populated_store();

        store.save_snapshot(&path).unwrap();
        assert!(path.exists());

        let restored = MemoryStore::load_snapshot(&path).unwrap();
        let node = restored.get_node_execution(&node_id).unwrap();
        assert_eq!(node.status, Status::AsyncWaiting);
        assert_eq!(node.version, 1);
        assert_eq!(node.correlation_ids, vec!["cid-1".to_string()]);

        let plan = restored.get_plan_execution(&plan_id).unwrap();
        assert_eq!(plan.plan.len(), 2);
    }

    #[test]
    fn test_restored_store_keeps_version_guard() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        let (store, _, node_id) = populated_store();
        store.save_snapshot(&path).unwrap();

        let restored = MemoryStore::load_snapshot(&path).unwrap();
        assert!(restored.update_node_execution(&node_id, 0, &mut |_| {}).is_err());
        assert!(restored.update_node_execution(&node_id, 1, &mut |_| {}).is_ok());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let result = StoreSnapshot::load(dir.path().join("missing.json"));
        assert!(matches!(result, Err(StoreError::Io(_))));
    }

    #[test]
    fn test_load_corrupt_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            StoreSnapshot::load(&path),
            Err(StoreError::Serialization(_))
        ));
    }
}
