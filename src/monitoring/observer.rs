//! Execution Observers
//!
//! Fire-and-forget listeners for status changes. Observers run on the
//! thread that made the change; a panicking observer is logged and skipped.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use log::error;
use parking_lot::RwLock;
use serde_json::Value;

use crate::execution::{NodeExecution, PlanExecution, Status};

/// Receives engine events.
pub trait ExecutionObserver: Send + Sync {
    /// A node moved from `previous` to `node.status`.
    fn on_node_status(&self, _node: &NodeExecution, _previous: Status) {}

    /// A plan moved from `previous` to `plan.status`.
    fn on_plan_status(&self, _plan: &PlanExecution, _previous: Status) {}

    /// Progress reported for a waiting node.
    fn on_progress(&self, _node_execution_id: &str, _data: &Value) {}
}

/// Fans events out to every registered observer.
#[derive(Default)]
pub struct ObserverHub {
    observers: RwLock<Vec<Arc<dyn ExecutionObserver>>>,
}

impl ObserverHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, observer: Arc<dyn ExecutionObserver>) {
        self.observers.write().push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.read().is_empty()
    }

    pub fn node_status(&self, node: &NodeExecution, previous: Status) {
        self.each("node status", |o| o.on_node_status(node, previous));
    }

    pub fn plan_status(&self, plan: &PlanExecution, previous: Status) {
        self.each("plan status", |o| o.on_plan_status(plan, previous));
    }

    pub fn progress(&self, node_execution_id: &str, data: &Value) {
        self.each("progress", |o| o.on_progress(node_execution_id, data));
    }

    fn each(&self, event: &str, f: impl Fn(&dyn ExecutionObserver)) {
        // Cloned so observers may register further observers.
        let observers = self.observers.read().clone();
        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))).is_err() {
                error!("Observer panicked while handling {} event", event);
            }
        }
    }
}
