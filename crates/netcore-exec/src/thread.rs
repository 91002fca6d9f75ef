//! Executor that starts an OS thread per submission burst
//!
//! A burst thread drains the lock-free queue and exits once it is empty.
//! The next enqueue after that starts a new one. At most one burst thread
//! runs at a time.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_queue::SegQueue;
use netcore_core::{kdebug, kerror, ExecError, ExecResult, Executor, Task};

use crate::worker::{join_unless_current, run_task};

struct Inner {
    name: String,
    queue: SegQueue<Task>,
    /// A burst thread owns the queue
    active: AtomicBool,
    shutdown: AtomicBool,
    handles: Mutex<Vec<JoinHandle<()>>>,
    bursts: AtomicUsize,
}

pub struct ThreadExecutor {
    inner: Arc<Inner>,
}

impl ThreadExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                queue: SegQueue::new(),
                active: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                handles: Mutex::new(Vec::new()),
                bursts: AtomicUsize::new(0),
            }),
        }
    }

    /// Burst threads started so far.
    pub fn bursts(&self) -> usize {
        self.inner.bursts.load(Ordering::Relaxed)
    }

    fn spawn_burst(&self) -> ExecResult<()> {
        let inner = Arc::clone(&self.inner);
        let n = self.inner.bursts.fetch_add(1, Ordering::Relaxed);
        let spawned = thread::Builder::new()
            .name(format!("{}-burst-{}", self.inner.name, n))
            .spawn(move || burst_loop(inner));
        match spawned {
            Ok(handle) => {
                let mut handles = self.inner.handles.lock().unwrap();
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
                Ok(())
            }
            Err(e) => {
                // Queued tasks wait for the next successful burst.
                self.inner.active.store(false, Ordering::SeqCst);
                kerror!("[{}] burst thread spawn failed: {}", self.inner.name, e);
                Err(ExecError::SpawnFailed)
            }
        }
    }
}

fn burst_loop(inner: Arc<Inner>) {
    loop {
        while let Some(task) = inner.queue.pop() {
            if inner.shutdown.load(Ordering::Acquire) {
                // Leave it for shutdown() to count
                inner.queue.push(task);
                return;
            }
            run_task(task);
        }
        inner.active.store(false, Ordering::SeqCst);
        // A producer may have pushed after our last pop but seen `active`
        // still set; take the queue back if nobody else did.
        if inner.queue.is_empty() || inner.active.swap(true, Ordering::SeqCst) {
            break;
        }
    }
    kdebug!("[{}] burst done", inner.name);
}

impl Executor for ThreadExecutor {
    fn enqueue(&self, task: Task) -> ExecResult<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            kerror!("[{}] enqueue after shutdown", self.inner.name);
            return Err(ExecError::ShutDown);
        }
        self.inner.queue.push(task);
        if !self.inner.active.swap(true, Ordering::SeqCst) {
            self.spawn_burst()?;
        }
        Ok(())
    }

    fn max_concurrency_level(&self) -> usize {
        1
    }

    fn shutdown(&self) -> usize {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let handles = std::mem::take(&mut *self.inner.handles.lock().unwrap());
        for h in handles {
            join_unless_current(h);
        }
        let mut cancelled = 0;
        while self.inner.queue.pop().is_some() {
            cancelled += 1;
        }
        cancelled
    }

    fn shutdown_requested(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for ThreadExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
