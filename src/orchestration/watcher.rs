//! Timeout Watcher
//!
//! A background thread that ticks at a fixed interval. Each tick the engine
//! expires overdue waiting nodes, starts delayed nodes whose time has come
//! and purges old notify responses.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, error};
use parking_lot::{Condvar, Mutex};

/// Nodes waiting for a start time (initial wait, retry backoff).
#[derive(Debug, Default)]
pub struct DelayedQueue {
    entries: Mutex<BinaryHeap<Reverse<(DateTime<Utc>, u64, String)>>>,
    next_seq: Mutex<u64>,
}

impl DelayedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, node_execution_id: impl Into<String>, due: DateTime<Utc>) {
        let seq = {
            let mut next = self.next_seq.lock();
            *next += 1;
            *next
        };
        self.entries.lock().push(Reverse((due, seq, node_execution_id.into())));
    }

    /// Removes and returns every entry due at `now`, earliest first.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut entries = self.entries.lock();
        let mut due = Vec::new();
        while let Some(Reverse((at, _, _))) = entries.peek() {
            if *at > now {
                break;
            }
            if let Some(Reverse((_, _, id))) = entries.pop() {
                due.push(id);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Handle to the ticking thread.
pub struct Watcher {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    /// Spawns a thread calling `tick` every `interval` until stopped or
    /// until `tick` returns false.
    pub fn spawn<F>(interval: Duration, tick: F) -> std::io::Result<Self>
    where
        F: Fn() -> bool + Send + 'static,
    {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&stop);

        let handle = thread::Builder::new().name("watcher".to_string()).spawn(move || {
            let (lock, condvar) = &*signal;
            loop {
                {
                    let mut stopped = lock.lock();
                    if *stopped {
                        break;
                    }
                    condvar.wait_for(&mut stopped, interval);
                    if *stopped {
                        break;
                    }
                }
                if !tick() {
                    break;
                }
            }
            debug!("Watcher stopped");
        })?;

        Ok(Self {
            stop,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Signals the thread and waits for it, unless called from the watcher
    /// itself.
    pub fn stop(&self) {
        {
            let (lock, condvar) = &*self.stop;
            *lock.lock() = true;
            condvar.notify_all();
        }

        if let Some(handle) = self.handle.lock().take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("Watcher thread terminated abnormally");
            }
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        let (lock, condvar) = &*self.stop;
        *lock.lock() = true;
        condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_delayed_queue_orders_by_due_time() {
        let queue = DelayedQueue::new();
        let now = Utc::now();
        queue.schedule("late", now + chrono::Duration::seconds(10));
        queue.schedule("early", now - chrono::Duration::seconds(1));
        queue.schedule("now", now);

        assert_eq!(queue.take_due(now), vec!["early".to_string(), "now".to_string()]);
        assert_eq!(queue.len(), 1);
        assert!(queue.take_due(now).is_empty());
        assert_eq!(
            queue.take_due(now + chrono::Duration::seconds(11)),
            vec!["late".to_string()]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_watcher_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let watcher = Watcher::spawn(Duration::from_millis(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        })
        .unwrap();

        thread::sleep(Duration::from_millis(100));
        watcher.stop();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen > 0);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[test]
    fn test_rejected_duplicate_watcher_is_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let spawn = |ticks: &Arc<AtomicUsize>| {
            let counter = Arc::clone(ticks);
            Watcher::spawn(Duration::from_millis(5), move || {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            })
            .unwrap()
        };

        let slot = once_cell::sync::OnceCell::new();
        assert!(slot.set(spawn(&Arc::new(AtomicUsize::new(0)))).is_ok());
        match slot.set(spawn(&ticks)) {
            Ok(()) => panic!("second watcher accepted"),
            Err(duplicate) => duplicate.stop(),
        }

        let seen = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
        if let Some(watcher) = slot.get() {
            watcher.stop();
        }
    }

    #[test]
    fn test_watcher_exits_when_tick_declines() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let watcher = Watcher::spawn(Duration::from_millis(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            false
        })
        .unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        watcher.stop();
    }
}
