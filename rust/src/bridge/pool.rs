use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use anyhow::{ensure, Context};
use parking_lot::Mutex;
use serde::Serialize;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Counters {
    queued: AtomicUsize,
    active: AtomicUsize,
    submitted: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub size: usize,
    pub queued: usize,
    pub active: usize,
    pub submitted: u64,
    pub completed: u64,
}

/// Fixed set of OS threads running blocking jobs.
///
/// Jobs beyond the number of idle workers wait in an unbounded FIFO queue.
/// A worker runs one job to completion before taking the next one.
pub struct WorkerPool {
    tx: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    pub fn new(size: usize) -> anyhow::Result<Self> {
        ensure!(size > 0, "Worker pool needs at least one thread");
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let rx = rx.clone();
            let counters = counters.clone();
            let handle = std::thread::Builder::new()
                .name(format!("palma-worker-{}", index))
                .spawn(move || worker_loop(index, &rx, &counters))
                .with_context(|| format!("Failed to spawn worker {}", index))?;
            workers.push(handle);
        }
        info!(size, "Worker pool started.");
        Ok(Self { tx: Some(tx), workers, counters })
    }

    /// Queues `job`; it runs as soon as a worker is free.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.counters.submitted.fetch_add(1, Ordering::SeqCst);
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        let sent = match &self.tx {
            Some(tx) => tx.send(Box::new(job)).is_ok(),
            None => false,
        };
        if !sent {
            // Only reachable if every worker thread has died.
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
            error!("Worker pool is gone; job dropped.");
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.size(),
            queued: self.counters.queued.load(Ordering::SeqCst),
            active: self.counters.active.load(Ordering::SeqCst),
            submitted: self.counters.submitted.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
        }
    }

    /// Stops accepting jobs, lets queued jobs finish, and joins the workers.
    pub fn shutdown(mut self) {
        self.join_all();
    }

    fn join_all(&mut self) {
        drop(self.tx.take());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread panicked outside a job.");
            }
        }
        let panicked = self.counters.panicked.load(Ordering::SeqCst);
        info!(panicked, "Worker pool stopped.");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.tx.is_some() {
            self.join_all();
        }
    }
}

fn worker_loop(
    index: usize,
    rx: &Mutex<mpsc::Receiver<Job>>,
    counters: &Counters,
) {
    loop {
        // The lock is only held while waiting, so idle workers queue up on
        // it in turn and jobs are taken in submission order.
        let job = match rx.lock().recv() {
            Ok(job) => job,
            Err(_) => break,
        };
        counters.queued.fetch_sub(1, Ordering::SeqCst);
        counters.active.fetch_add(1, Ordering::SeqCst);
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            counters.panicked.fetch_add(1, Ordering::SeqCst);
            error!(worker = index, "Job panicked.");
        }
        counters.active.fetch_sub(1, Ordering::SeqCst);
        counters.completed.fetch_add(1, Ordering::SeqCst);
    }
    debug!(worker = index, "Worker exiting.");
}
