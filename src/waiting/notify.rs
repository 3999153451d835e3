//! Wait / Notify
//!
//! Correlates asynchronous completions with the waits that need them.
//!
//! A wait names a set of correlation ids and fires its callback exactly once,
//! when every one of them has a response. Responses may arrive before the
//! wait is registered; they are kept until consumed and then retained as a
//! record until the TTL passes, so redelivered notifications are recognised
//! and discarded.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default retention for notify responses (21 days).
pub const DEFAULT_RESPONSE_TTL: Duration = Duration::from_secs(21 * 24 * 60 * 60);

/// A completion notification for one correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyResponse {
    pub correlation_id: String,
    pub data: Value,
    pub is_error: bool,
    pub received_at: DateTime<Utc>,
}

/// Invoked when all correlation ids of a wait have responded.
pub trait NotifyCallback: Send + Sync {
    fn on_notify(&self, responses: HashMap<String, NotifyResponse>);

    /// Invoked instead of `on_notify` when the wait times out.
    fn on_timeout(&self, _missing: Vec<String>) {}
}

/// Receives progress updates for a pending wait.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, correlation_id: &str, data: &Value);
}

/// A request to be called back once work completes.
#[derive(Clone)]
pub struct WaitRequest {
    /// Caller-chosen id; registering the same id again replaces the wait
    pub id: String,
    pub correlation_ids: Vec<String>,
    pub callback: Arc<dyn NotifyCallback>,
    pub progress_callback: Option<Arc<dyn ProgressCallback>>,
    pub timeout: Option<Duration>,
}

impl WaitRequest {
    pub fn new(id: impl Into<String>, correlation_ids: Vec<String>, callback: Arc<dyn NotifyCallback>) -> Self {
        Self {
            id: id.into(),
            correlation_ids,
            callback,
            progress_callback: None,
            timeout: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress_callback = Some(progress);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Debug for WaitRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitRequest")
            .field("id", &self.id)
            .field("correlation_ids", &self.correlation_ids)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Counts from one purge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub expired_responses: usize,
    pub timed_out_waits: usize,
}

struct StoredResponse {
    response: NotifyResponse,
    consumed: bool,
}

struct PendingWait {
    request: WaitRequest,
    deadline: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct NotifyState {
    responses: HashMap<String, StoredResponse>,
    waits: HashMap<String, PendingWait>,
    /// correlation id -> ids of waits that include it
    index: HashMap<String, Vec<String>>,
}

impl NotifyState {
    fn unindex(&mut self, wait: &PendingWait) {
        for cid in &wait.request.correlation_ids {
            if let Some(ids) = self.index.get_mut(cid) {
                ids.retain(|id| id != &wait.request.id);
                if ids.is_empty() {
                    self.index.remove(cid);
                }
            }
        }
    }

    fn is_available(&self, correlation_id: &str) -> bool {
        self.responses
            .get(correlation_id)
            .map(|stored| !stored.consumed)
            .unwrap_or(false)
    }

    /// Removes the wait if every correlation id has an unconsumed response,
    /// marking the responses consumed.
    fn take_if_complete(&mut self, wait_id: &str) -> Option<(Arc<dyn NotifyCallback>, HashMap<String, NotifyResponse>)> {
        let complete = self
            .waits
            .get(wait_id)
            .map(|w| w.request.correlation_ids.iter().all(|c| self.is_available(c)))
            .unwrap_or(false);
        if !complete {
            return None;
        }

        let wait = self.waits.remove(wait_id)?;
        self.unindex(&wait);

        let mut collected = HashMap::new();
        for cid in &wait.request.correlation_ids {
            if let Some(stored) = self.responses.get_mut(cid).filter(|s| !s.consumed) {
                stored.consumed = true;
                collected.insert(cid.clone(), stored.response.clone());
            }
        }
        Some((wait.request.callback, collected))
    }
}

/// Wait/notify correlation service.
///
/// Callbacks always run after the internal lock is released, on the thread
/// that completed the wait.
pub struct WaitNotifyService {
    state: Mutex<NotifyState>,
    response_ttl: chrono::Duration,
}

impl WaitNotifyService {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_RESPONSE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            state: Mutex::new(NotifyState::default()),
            response_ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(21)),
        }
    }

    /// Registers a wait. Never blocks; fires immediately if every response
    /// is already present.
    pub fn wait_for_all_on(&self, request: WaitRequest) {
        let wait_id = request.id.clone();
        let deadline = request
            .timeout
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .map(|t| Utc::now() + t);

        let fired = {
            let mut state = self.state.lock();
            if let Some(previous) = state.waits.remove(&wait_id) {
                debug!("Replacing existing wait {}", wait_id);
                state.unindex(&previous);
            }
            for cid in &request.correlation_ids {
                state.index.entry(cid.clone()).or_default().push(wait_id.clone());
            }
            state.waits.insert(wait_id.clone(), PendingWait { request, deadline });
            state.take_if_complete(&wait_id)
        };

        match fired {
            Some((callback, responses)) => {
                debug!("Wait {} satisfied on registration", wait_id);
                callback.on_notify(responses);
            }
            None => debug!("Registered wait {}", wait_id),
        }
    }

    /// Records a successful completion. Returns false for a duplicate.
    pub fn notify(&self, correlation_id: &str, data: Value) -> bool {
        self.deliver(correlation_id, data, false)
    }

    /// Records a failed completion. Returns false for a duplicate.
    pub fn notify_error(&self, correlation_id: &str, data: Value) -> bool {
        self.deliver(correlation_id, data, true)
    }

    fn deliver(&self, correlation_id: &str, data: Value, is_error: bool) -> bool {
        let fired = {
            let mut state = self.state.lock();
            if state.responses.contains_key(correlation_id) {
                debug!("Discarding duplicate notification for {}", correlation_id);
                return false;
            }

            state.responses.insert(
                correlation_id.to_string(),
                StoredResponse {
                    response: NotifyResponse {
                        correlation_id: correlation_id.to_string(),
                        data,
                        is_error,
                        received_at: Utc::now(),
                    },
                    consumed: false,
                },
            );

            let waiting = state.index.get(correlation_id).cloned().unwrap_or_default();
            waiting
                .iter()
                .filter_map(|wait_id| state.take_if_complete(wait_id))
                .collect::<Vec<_>>()
        };

        for (callback, responses) in fired {
            callback.on_notify(responses);
        }
        true
    }

    /// Forwards progress to every wait on `correlation_id`. Never changes
    /// any state.
    pub fn notify_progress(&self, correlation_id: &str, data: &Value) {
        let listeners: Vec<Arc<dyn ProgressCallback>> = {
            let state = self.state.lock();
            state
                .index
                .get(correlation_id)
                .into_iter()
                .flatten()
                .filter_map(|id| state.waits.get(id))
                .filter_map(|w| w.request.progress_callback.clone())
                .collect()
        };

        for listener in listeners {
            listener.on_progress(correlation_id, data);
        }
    }

    /// Drops a pending wait. Returns false if it was not pending.
    pub fn cancel(&self, wait_id: &str) -> bool {
        let mut state = self.state.lock();
        match state.waits.remove(wait_id) {
            Some(wait) => {
                state.unindex(&wait);
                debug!("Cancelled wait {}", wait_id);
                true
            }
            None => false,
        }
    }

    /// Expires responses older than the TTL and times out overdue waits.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> PurgeReport {
        let (report, timed_out) = {
            let mut state = self.state.lock();
            let ttl = self.response_ttl;

            let before = state.responses.len();
            state.responses.retain(|_, stored| stored.response.received_at + ttl > now);
            let expired_responses = before - state.responses.len();

            let overdue: Vec<String> = state
                .waits
                .iter()
                .filter(|(_, w)| w.deadline.map(|d| d <= now).unwrap_or(false))
                .map(|(id, _)| id.clone())
                .collect();

            let mut timed_out = Vec::new();
            for wait_id in overdue {
                if let Some(wait) = state.waits.remove(&wait_id) {
                    state.unindex(&wait);
                    let missing: Vec<String> = wait
                        .request
                        .correlation_ids
                        .iter()
                        .filter(|c| !state.responses.contains_key(*c))
                        .cloned()
                        .collect();
                    timed_out.push((wait.request.callback, missing));
                }
            }

            (
                PurgeReport {
                    expired_responses,
                    timed_out_waits: timed_out.len(),
                },
                timed_out,
            )
        };

        for (callback, missing) in timed_out {
            warn!("Wait timed out with {} missing response(s)", missing.len());
            callback.on_timeout(missing);
        }
        report
    }

    pub fn pending_waits(&self) -> usize {
        self.state.lock().waits.len()
    }

    pub fn is_waiting(&self, wait_id: &str) -> bool {
        self.state.lock().waits.contains_key(wait_id)
    }

    /// True if a response for `correlation_id` has been received and not
    /// yet consumed by a wait.
    pub fn has_unconsumed_response(&self, correlation_id: &str) -> bool {
        self.state
            .lock()
            .responses
            .get(correlation_id)
            .map(|s| !s.consumed)
            .unwrap_or(false)
    }
}

impl Default for WaitNotifyService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;

    #[derive(Default)]
    struct Recorder {
        calls: AtomicUsize,
        timeouts: AtomicUsize,
        last: Mutex<Option<HashMap<String, NotifyResponse>>>,
    }

    impl NotifyCallback for Recorder {
        fn on_notify(&self, responses: HashMap<String, NotifyResponse>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some(responses);
        }

        fn on_timeout(&self, _missing: Vec<String>) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl ProgressCallback for Recorder {
        fn on_progress(&self, _correlation_id: &str, _data: &Value) {
            self.calls.fetch_add(100, Ordering::SeqCst);
        }
    }

    fn cids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_join_semantics() {
        let service = WaitNotifyService::new();
        let recorder = Arc::new(Recorder::default());
        service.wait_for_all_on(WaitRequest::new("w1", cids(&["a", "b"]), recorder.clone()));

        assert!(service.notify("a", json!(1)));
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);

        assert!(service.notify_error("b", json!("boom")));
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);

        let responses = recorder.last.lock().take().unwrap();
        assert_eq!(responses.len(), 2);
        assert!(responses["b"].is_error);
        assert!(!responses["a"].is_error);
        assert_eq!(service.pending_waits(), 0);
    }

    #[test]
    fn test_response_before_registration() {
        let service = WaitNotifyService::new();
        let recorder = Arc::new(Recorder::default());

        service.notify("early", json!({"ok": true}));
        assert!(service.has_unconsumed_response("early"));

        service.wait_for_all_on(WaitRequest::new("w1", cids(&["early"]), recorder.clone()));
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
        assert!(!service.has_unconsumed_response("early"));
    }

    #[test]
    fn test_duplicate_notify_discarded() {
        let service = WaitNotifyService::new();
        let recorder = Arc::new(Recorder::default());
        service.wait_for_all_on(WaitRequest::new("w1", cids(&["a"]), recorder.clone()));

        assert!(service.notify("a", json!(1)));
        assert!(!service.notify("a", json!(2)));
        assert!(!service.notify_error("a", json!(3)));
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_consumed_response_not_redelivered() {
        let service = WaitNotifyService::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());

        service.wait_for_all_on(WaitRequest::new("w1", cids(&["cid-1"]), first.clone()));
        assert!(service.notify("cid-1", json!({"run": 1})));
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);

        service.wait_for_all_on(WaitRequest::new("w2", cids(&["cid-1"]), second.clone()));
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
        assert!(service.is_waiting("w2"));

        // Still a duplicate for the service, so w2 stays pending.
        assert!(!service.notify("cid-1", json!({"run": 2})));
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_notifies_fire_once() {
        let service = Arc::new(WaitNotifyService::new());
        let recorder = Arc::new(Recorder::default());
        let ids: Vec<String> = (0..8).map(|i| format!("cid-{}", i)).collect();
        service.wait_for_all_on(WaitRequest::new("w1", ids.clone(), recorder.clone()));

        let barrier = Arc::new(Barrier::new(ids.len() * 2));
        let handles: Vec<_> = ids
            .iter()
            .chain(ids.iter())
            .cloned()
            .map(|cid| {
                let service = Arc::clone(&service);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    service.notify(&cid, json!(null));
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_prevents_callback() {
        let service = WaitNotifyService::new();
        let recorder = Arc::new(Recorder::default());
        service.wait_for_all_on(WaitRequest::new("w1", cids(&["a"]), recorder.clone()));

        assert!(service.cancel("w1"));
        assert!(!service.cancel("w1"));
        service.notify("a", json!(1));
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_progress_reaches_pending_wait() {
        let service = WaitNotifyService::new();
        let recorder = Arc::new(Recorder::default());
        service.wait_for_all_on(
            WaitRequest::new("w1", cids(&["a"]), recorder.clone()).with_progress(recorder.clone()),
        );

        service.notify_progress("a", &json!({"percent": 50}));
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 100);
        assert!(service.is_waiting("w1"));
    }

    #[test]
    fn test_purge_expires_old_responses() {
        let service = WaitNotifyService::with_ttl(Duration::from_secs(60));
        service.notify("old", json!(1));

        let soon = Utc::now() + chrono::Duration::seconds(30);
        assert_eq!(service.purge_expired(soon).expired_responses, 0);

        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(service.purge_expired(later).expired_responses, 1);

        // Once purged the correlation id is unknown again.
        assert!(service.notify("old", json!(2)));
    }

    #[test]
    fn test_default_ttl_is_three_weeks() {
        let service = WaitNotifyService::new();
        service.notify("cid", json!(1));

        let twenty_days = Utc::now() + chrono::Duration::days(20);
        assert_eq!(service.purge_expired(twenty_days).expired_responses, 0);
        assert!(!service.notify("cid", json!(2)));

        let twenty_two_days = Utc::now() + chrono::Duration::days(22);
        assert_eq!(service.purge_expired(twenty_two_days).expired_responses, 1);
    }

    #[test]
    fn test_wait_timeout() {
        let service = WaitNotifyService::new();
        let recorder = Arc::new(Recorder::default());
        service.wait_for_all_on(
            WaitRequest::new("w1", cids(&["a", "b"]), recorder.clone()).with_timeout(Duration::from_secs(5)),
        );
        service.notify("a", json!(1));

        let report = service.purge_expired(Utc::now() + chrono::Duration::seconds(10));
        assert_eq!(report.timed_out_waits, 1);
        assert_eq!(recorder.timeouts.load(Ordering::SeqCst), 1);

        service.notify("b", json!(2));
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_empty_wait_fires_immediately() {
        let service = WaitNotifyService::new();
        let recorder = Arc::new(Recorder::default());
        service.wait_for_all_on(WaitRequest::new("w1", Vec::new(), recorder.clone()));
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 1);
    }
}
