//! Single dedicated worker thread
//!
//! Tasks from foreign threads go through the public queue and wake the
//! worker; tasks enqueued by a running task on the worker itself go
//! straight to the private queue.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use netcore_core::{kdebug, kerror, ExecError, ExecResult, Executor, Task};

use crate::worker::{self, join_unless_current, run_task, WorkerCore};

struct Inner {
    name: String,
    owner: usize,
    core: WorkerCore,
    shutdown: AtomicBool,
    /// Private-queue leftovers dropped by the worker on exit
    cancelled: AtomicUsize,
}

pub struct WorkerThread {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerThread {
    /// Spawn the worker thread.
    pub fn new(name: impl Into<String>) -> ExecResult<Self> {
        let inner = Arc::new(Inner {
            name: name.into(),
            owner: worker::next_owner_id(),
            core: WorkerCore::new(),
            shutdown: AtomicBool::new(false),
            cancelled: AtomicUsize::new(0),
        });
        let thread_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(inner.name.clone())
            .spawn(move || worker_loop(thread_inner))
            .map_err(|e| {
                kerror!("[{}] worker thread spawn failed: {}", inner.name, e);
                ExecError::SpawnFailed
            })?;
        Ok(Self {
            inner,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Whether the calling thread is this worker.
    pub fn is_current(&self) -> bool {
        worker::current_index(self.inner.owner).is_some()
    }
}

fn worker_loop(inner: Arc<Inner>) {
    worker::bind_current(inner.owner, 0);
    kdebug!("[{}] worker started", inner.name);

    'outer: loop {
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        worker::with_private(|q| inner.core.take_into(q));
        while let Some(task) = worker::pop_local() {
            run_task(task);
            if inner.shutdown.load(Ordering::Acquire) {
                break 'outer;
            }
        }
        if !inner.core.has_public() {
            inner.core.wait(None);
        }
    }

    let left = worker::unbind_current();
    inner.cancelled.fetch_add(left.len(), Ordering::AcqRel);
    kdebug!("[{}] worker exited", inner.name);
}

impl Executor for WorkerThread {
    fn enqueue(&self, task: Task) -> ExecResult<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            kerror!("[{}] enqueue after shutdown", self.inner.name);
            return Err(ExecError::ShutDown);
        }
        if let Err(task) = worker::try_push_local(self.inner.owner, task, false) {
            self.inner.core.push(task);
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
        self.inner.core.wake();
        if let Some(h) = self.handle.lock().unwrap().take() {
            join_unless_current(h);
        }
        self.inner.core.drain_public() + self.inner.cancelled.swap(0, Ordering::AcqRel)
    }

    fn shutdown_requested(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
