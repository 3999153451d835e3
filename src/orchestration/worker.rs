//! Worker Pool
//!
//! A fixed set of threads pulling jobs from one shared channel. Jobs never
//! block on each other; a suspended node gives its thread back.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::error::{EngineError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size thread pool.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    in_flight: Arc<AtomicUsize>,
    size: usize,
}

impl WorkerPool {
    /// Spawns `size` workers (at least one).
    pub fn new(size: usize, name: &str) -> Result<Self> {
        let size = size.max(1);
        let (tx, rx): (Sender<Job>, Receiver<Job>) = channel();
        let rx = Arc::new(Mutex::new(rx));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(size);
        for index in 0..size {
            let rx = Arc::clone(&rx);
            let in_flight = Arc::clone(&in_flight);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || worker_loop(rx, in_flight))
                .map_err(|e| {
                    error!("Failed to spawn worker thread: {}", e);
                    EngineError::ShuttingDown
                })?;
            handles.push(handle);
        }

        debug!("Started {} worker(s)", size);

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
            in_flight,
            size,
        })
    }

    /// Queues a job. Fails once the pool is shutting down.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(EngineError::ShuttingDown)?;

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        sender.send(Box::new(job)).map_err(|_| {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            EngineError::ShuttingDown
        })
    }

    /// Jobs queued or running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Stops accepting jobs and waits up to `grace` for queued ones to
    /// finish before joining the workers. Workers still busy after the grace
    /// period are detached.
    ///
    /// A worker calling this does not wait for itself.
    pub fn shutdown(&self, grace: Duration) {
        self.sender.lock().take();

        let deadline = Instant::now() + grace;
        while self.in_flight() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if self.in_flight() > 0 {
            warn!("Detaching workers with {} job(s) still in flight", self.in_flight());
            self.handles.lock().clear();
            return;
        }

        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Worker thread terminated abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Workers exit on their own once the channel closes.
        self.sender.lock().take();
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>, in_flight: Arc<AtomicUsize>) {
    loop {
        let job = {
            let rx = rx.lock();
            rx.recv()
        };

        match job {
            Ok(job) => {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("Worker job panicked");
                }
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn test_jobs_run_on_workers() {
        let pool = WorkerPool::new(4, "test").unwrap();
        let (tx, rx) = channel();

        for i in 0..20 {
            let tx = tx.clone();
            pool.execute(move || {
                tx.send(i).unwrap();
            })
            .unwrap();
        }

        let mut received: Vec<i32> = (0..20).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        received.sort();
        assert_eq!(received, (0..20).collect::<Vec<_>>());
        assert_eq!(pool.size(), 4);
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(1, "test").unwrap();
        pool.execute(|| panic!("job bug")).unwrap();

        let (tx, rx) = channel();
        pool.execute(move || tx.send("alive").unwrap()).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "alive");
    }

    #[test]
    fn test_shutdown_drains_and_rejects() {
        let pool = WorkerPool::new(2, "test").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                thread::sleep(Duration::from_millis(5));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown(Duration::from_secs(5));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert_eq!(pool.in_flight(), 0);
        assert!(matches!(pool.execute(|| {}), Err(EngineError::ShuttingDown)));
    }

    #[test]
    fn test_zero_size_gets_one_worker() {
        let pool = WorkerPool::new(0, "test").unwrap();
        assert_eq!(pool.size(), 1);
    }
}
