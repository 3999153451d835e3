//! Persistence Collaborator
//!
//! The engine never keeps execution state of its own: every plan execution,
//! node execution and interrupt lives behind [`ExecutionStore`]. Updates are
//! conditional on the record's `version`, which is how concurrent resume,
//! interrupt and timeout paths avoid lost updates.
//!
//! - [`memory`]: In-process implementation
//! - [`snapshot`]: JSON snapshots of a [`MemoryStore`] for restart recovery

pub mod memory;
pub mod snapshot;

pub use memory::MemoryStore;
pub use snapshot::StoreSnapshot;

use crate::error::StoreError;
use crate::execution::{NodeExecution, PlanExecution, Status};
use crate::orchestration::interrupt::{Interrupt, InterruptState};

/// Storage interface consumed by the engine.
///
/// `update_*` applies `update` to the stored record only if its version still
/// equals `expected_version`, then bumps the version and returns the new
/// record. A mismatch yields [`StoreError::VersionConflict`] and leaves the
/// record untouched.
pub trait ExecutionStore: Send + Sync {
    fn insert_plan_execution(&self, execution: PlanExecution) -> Result<(), StoreError>;

    fn get_plan_execution(&self, id: &str) -> Result<PlanExecution, StoreError>;

    fn update_plan_execution(
        &self,
        id: &str,
        expected_version: u64,
        update: &mut dyn FnMut(&mut PlanExecution),
    ) -> Result<PlanExecution, StoreError>;

    fn find_plan_executions_by_status(&self, statuses: &[Status]) -> Result<Vec<PlanExecution>, StoreError>;

    fn insert_node_execution(&self, execution: NodeExecution) -> Result<(), StoreError>;

    fn get_node_execution(&self, id: &str) -> Result<NodeExecution, StoreError>;

    fn update_node_execution(
        &self,
        id: &str,
        expected_version: u64,
        update: &mut dyn FnMut(&mut NodeExecution),
    ) -> Result<NodeExecution, StoreError>;

    /// Node executions in any of `statuses`, oldest first.
    fn find_node_executions_by_status(&self, statuses: &[Status]) -> Result<Vec<NodeExecution>, StoreError>;

    /// All node executions of one plan execution, oldest first.
    fn find_node_executions_for_plan(&self, plan_execution_id: &str) -> Result<Vec<NodeExecution>, StoreError>;

    /// Direct children of a node execution, oldest first.
    fn find_children(&self, parent_id: &str) -> Result<Vec<NodeExecution>, StoreError>;

    fn save_interrupt(&self, interrupt: Interrupt) -> Result<(), StoreError>;

    fn update_interrupt_state(&self, id: &str, state: InterruptState) -> Result<Interrupt, StoreError>;

    fn find_interrupts_for_plan(&self, plan_execution_id: &str) -> Result<Vec<Interrupt>, StoreError>;
}
