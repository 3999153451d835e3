//! Task Dispatch
//!
//! The boundary to whatever actually performs TASK work. A dispatcher hands
//! the request off and returns a correlation id; the result comes back later
//! through [`WaitNotifyService::notify`].

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::plan::Ambiance;
use crate::waiting::WaitNotifyService;

/// Work handed to the dispatch collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub node_execution_id: String,
    pub plan_execution_id: String,
    pub step_type: String,
    pub parameters: Value,
    pub ambiance: Ambiance,
}

/// Errors reported by a dispatcher.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    #[error("dispatcher unavailable: {0}")]
    Unavailable(String),

    #[error("task rejected: {0}")]
    Rejected(String),
}

/// Hands tasks to external workers.
pub trait TaskDispatcher: Send + Sync {
    /// Starts the task and returns its correlation id.
    fn dispatch(&self, request: &TaskRequest) -> Result<String, DispatchError>;
}

/// Completes every task in-process after a fixed delay.
///
/// The response echoes `parameters.result` (or the whole parameter object).
/// Setting `parameters.fail: true` produces an error response instead.
pub struct LoopbackDispatcher {
    notify: Arc<WaitNotifyService>,
    delay: Duration,
}

impl LoopbackDispatcher {
    pub fn new(notify: Arc<WaitNotifyService>, delay: Duration) -> Self {
        Self { notify, delay }
    }
}

impl TaskDispatcher for LoopbackDispatcher {
    fn dispatch(&self, request: &TaskRequest) -> Result<String, DispatchError> {
        let correlation_id = Uuid::new_v4().to_string();
        let notify = Arc::clone(&self.notify);
        let delay = self.delay;
        let fail = request.parameters.get("fail").and_then(Value::as_bool).unwrap_or(false);
        let payload = request
            .parameters
            .get("result")
            .cloned()
            .unwrap_or_else(|| json!({ "echo": request.parameters }));
        let cid = correlation_id.clone();

        debug!(
            "Loopback dispatch of {} for node {} ({:?} delay)",
            cid, request.node_execution_id, delay
        );

        thread::Builder::new()
            .name(format!("loopback-{}", &cid[..8]))
            .spawn(move || {
                thread::sleep(delay);
                let accepted = if fail {
                    notify.notify_error(&cid, payload)
                } else {
                    notify.notify(&cid, payload)
                };
                if !accepted {
                    warn!("Loopback response for {} was a duplicate", cid);
                }
            })
            .map_err(|e| DispatchError::Unavailable(e.to_string()))?;

        Ok(correlation_id)
    }
}

/// Records requests and leaves completion to the caller.
///
/// Useful when something else (a test, an operator) delivers the
/// notification.
#[derive(Default)]
pub struct RecordingDispatcher {
    requests: Mutex<Vec<(String, TaskRequest)>>,
    unavailable: Mutex<Option<String>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent dispatches fail with `reason`; `None` restores them.
    pub fn set_unavailable(&self, reason: Option<&str>) {
        *self.unavailable.lock() = reason.map(str::to_string);
    }

    /// Dispatched (correlation id, request) pairs, oldest first.
    pub fn dispatched(&self) -> Vec<(String, TaskRequest)> {
        self.requests.lock().clone()
    }

    /// Correlation id dispatched for a node execution, if any.
    pub fn correlation_id_for(&self, node_execution_id: &str) -> Option<String> {
        self.requests
            .lock()
            .iter()
            .find(|(_, r)| r.node_execution_id == node_execution_id)
            .map(|(cid, _)| cid.clone())
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }
}

impl TaskDispatcher for RecordingDispatcher {
    fn dispatch(&self, request: &TaskRequest) -> Result<String, DispatchError> {
        if let Some(reason) = self.unavailable.lock().clone() {
            return Err(DispatchError::Unavailable(reason));
        }
        let correlation_id = Uuid::new_v4().to_string();
        self.requests.lock().push((correlation_id.clone(), request.clone()));
        Ok(correlation_id)
    }
}
