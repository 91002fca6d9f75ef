//! Load-balancing thread pool
//!
//! N workers, each shaped like a `WorkerThread` (private queue in
//! thread-local storage, public queue plus semaphore for foreign threads).
//!
//! ```text
//!   foreign thread                     worker i
//!   ──────────────                     ────────
//!   enqueue(task)                      loop {
//!     ├─ own worker, private empty?      swap public → private
//!     │    └─ push private (no lock)     pop private
//!     ├─ idle.find_idle_worker(hint)       ├─ set_busy, balance_work, run
//!     │    └─ else round robin             └─ none: set_idle, wait(max_idle)
//!     └─ push public[i], wake,                    timeout → retire thread
//!        respawn worker i if retired   }
//! ```
//!
//! `balance_work` is push-style stealing: a worker holding two or more
//! private tasks hands a fair share of its tail to idle peers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use netcore_core::{kdebug, kerror, ConfigError, ExecError, ExecResult, Executor, Task};

use crate::config::PoolConfig;
use crate::idle::IdleWorkerSet;
use crate::worker::{self, join_unless_current, run_task, thread_hint, WorkerCore};

struct ThreadSlot {
    handle: Option<JoinHandle<()>>,
    /// OS thread is alive and serving this worker
    running: bool,
}

struct WorkerSlot {
    core: WorkerCore,
    thread: Mutex<ThreadSlot>,
}

struct PoolShared {
    name: String,
    owner: usize,
    workers: Box<[WorkerSlot]>,
    idle: IdleWorkerSet,
    shutdown: AtomicBool,
    round_robin: AtomicUsize,
    max_idle_time: Duration,
    /// Private-queue leftovers dropped by exiting workers
    cancelled: AtomicUsize,
    executed: AtomicU64,
    spawned: AtomicUsize,
    retired: AtomicUsize,
}

pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    /// Build the pool. Worker threads start lazily on first use.
    pub fn new(config: PoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let workers = (0..config.num_workers)
            .map(|_| WorkerSlot {
                core: WorkerCore::new(),
                thread: Mutex::new(ThreadSlot { handle: None, running: false }),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            shared: Arc::new(PoolShared {
                name: config.name,
                owner: worker::next_owner_id(),
                idle: IdleWorkerSet::new(config.num_workers, true),
                workers,
                shutdown: AtomicBool::new(false),
                round_robin: AtomicUsize::new(0),
                max_idle_time: config.max_idle_time,
                cancelled: AtomicUsize::new(0),
                executed: AtomicU64::new(0),
                spawned: AtomicUsize::new(0),
                retired: AtomicUsize::new(0),
            }),
        })
    }

    /// Pool with `n` workers and default idle timeout.
    pub fn with_workers(n: usize) -> Result<Self, ConfigError> {
        Self::new(PoolConfig::new().num_workers(n))
    }

    pub fn num_workers(&self) -> usize {
        self.shared.workers.len()
    }

    /// Index of the calling thread if it is one of this pool's workers.
    pub fn current_worker(&self) -> Option<usize> {
        worker::current_index(self.shared.owner)
    }

    /// Tasks run to completion (panicked ones included).
    pub fn executed(&self) -> u64 {
        self.shared.executed.load(Ordering::Relaxed)
    }

    /// Worker OS threads started over the pool's lifetime.
    pub fn spawned(&self) -> usize {
        self.shared.spawned.load(Ordering::Relaxed)
    }

    /// Worker OS threads that retired after `max_idle_time`.
    pub fn retired(&self) -> usize {
        self.shared.retired.load(Ordering::Relaxed)
    }

    pub fn running_workers(&self) -> usize {
        self.shared
            .workers
            .iter()
            .filter(|w| w.thread.lock().unwrap().running)
            .count()
    }
}

/// Push `task` to worker `index`'s public queue and make sure it has a thread.
fn enqueue_foreign(shared: &Arc<PoolShared>, index: usize, task: Task) -> ExecResult<()> {
    shared.workers[index].core.push(task);
    ensure_running(shared, index)
}

/// Start (or restart after retirement) worker `index`'s OS thread.
///
/// On spawn failure the queued tasks stay put and run once a later call
/// manages to start the worker.
fn ensure_running(shared: &Arc<PoolShared>, index: usize) -> ExecResult<()> {
    let mut slot = shared.workers[index].thread.lock().unwrap();
    if slot.running || shared.shutdown.load(Ordering::Acquire) {
        return Ok(());
    }
    // A retired thread released its slot and is exiting.
    if let Some(old) = slot.handle.take() {
        let _ = old.join();
    }
    let thread_shared = Arc::clone(shared);
    let spawned = thread::Builder::new()
        .name(format!("{}-{}", shared.name, index))
        .spawn(move || worker_loop(thread_shared, index));
    match spawned {
        Ok(handle) => {
            slot.handle = Some(handle);
            slot.running = true;
            shared.spawned.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        Err(e) => {
            kerror!("[{}] worker {} spawn failed: {}", shared.name, index, e);
            Err(ExecError::SpawnFailed)
        }
    }
}

fn worker_loop(shared: Arc<PoolShared>, index: usize) {
    worker::bind_current(shared.owner, index);
    let me = &shared.workers[index];
    kdebug!("[{}] worker {} started", shared.name, index);

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        worker::with_private(|q| me.core.take_into(q));
        if let Some(task) = worker::pop_local() {
            shared.idle.set_busy(index);
            balance_work(&shared, index);
            run_task(task);
            shared.executed.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        shared.idle.set_idle(index);
        if me.core.has_public() {
            continue;
        }
        if me.core.wait(Some(shared.max_idle_time)) {
            continue;
        }

        // Idle timeout. Retire under the slot lock so a concurrent
        // enqueue_foreign either sees `running == false` and respawns, or
        // its task is already visible here.
        let mut slot = me.thread.lock().unwrap();
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }
        if me.core.has_public() {
            continue;
        }
        slot.running = false;
        shared.retired.fetch_add(1, Ordering::Relaxed);
        kdebug!("[{}] worker {} retired after {:?} idle", shared.name, index, shared.max_idle_time);
        break;
    }

    let left = worker::unbind_current();
    if !left.is_empty() {
        shared.cancelled.fetch_add(left.len(), Ordering::AcqRel);
    }
}

/// Donate a fair share of the private tail to up to `len - 1` idle peers.
fn balance_work(shared: &Arc<PoolShared>, index: usize) {
    let len = worker::local_len();
    let n = shared.workers.len();
    if len < 2 || n < 2 || shared.idle.approx_idle() == 0 {
        return;
    }

    let max_peers = (len - 1).min(n - 1);
    let mut peers = Vec::with_capacity(max_peers);
    while peers.len() < max_peers {
        match shared.idle.find_idle_worker(index + 1 + peers.len()) {
            Some(p) if p == index => shared.idle.set_busy(p),
            Some(p) => peers.push(p),
            None => break,
        }
    }
    if peers.is_empty() {
        return;
    }

    let share = len / (peers.len() + 1);
    if share == 0 {
        for p in peers {
            shared.idle.set_idle(p);
        }
        return;
    }
    for p in peers {
        let tail: VecDeque<Task> = worker::with_private(|q| {
            let keep = q.len().saturating_sub(share);
            q.split_off(keep)
        })
        .unwrap_or_default();
        if tail.is_empty() {
            shared.idle.set_idle(p);
            continue;
        }
        shared.workers[p].core.push_many(tail);
        if let Err(e) = ensure_running(shared, p) {
            kerror!("[{}] donation to worker {} stranded: {}", shared.name, p, e);
        }
    }
}

impl Executor for ThreadPool {
    fn enqueue(&self, task: Task) -> ExecResult<()> {
        let shared = &self.shared;
        if shared.shutdown.load(Ordering::Acquire) {
            kerror!("[{}] enqueue after shutdown", shared.name);
            return Err(ExecError::ShutDown);
        }

        let task = match worker::try_push_local(shared.owner, task, true) {
            Ok(()) => return Ok(()),
            Err(task) => task,
        };

        let index = shared
            .idle
            .find_idle_worker(thread_hint())
            .unwrap_or_else(|| shared.round_robin.fetch_add(1, Ordering::Relaxed) % shared.workers.len());
        enqueue_foreign(shared, index, task)
    }

    fn max_concurrency_level(&self) -> usize {
        self.shared.workers.len()
    }

    fn shutdown(&self) -> usize {
        let shared = &self.shared;
        if shared.shutdown.swap(true, Ordering::AcqRel) {
            return 0;
        }
        for w in shared.workers.iter() {
            w.core.wake();
        }
        for w in shared.workers.iter() {
            let handle = {
                let mut slot = w.thread.lock().unwrap();
                slot.running = false;
                slot.handle.take()
            };
            if let Some(h) = handle {
                join_unless_current(h);
            }
        }
        let queued: usize = shared.workers.iter().map(|w| w.core.drain_public()).sum();
        let cancelled = queued + shared.cancelled.swap(0, Ordering::AcqRel);
        kdebug!("[{}] shut down, {} task(s) cancelled", shared.name, cancelled);
        cancelled
    }

    fn shutdown_requested(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcore_core::task;
    use std::sync::mpsc;
    use std::time::Instant;

    fn pool(n: usize, idle_ms: u64) -> ThreadPool {
        ThreadPool::new(
            PoolConfig::new()
                .name("pool-test")
                .num_workers(n)
                .max_idle_time(Duration::from_millis(idle_ms)),
        )
        .unwrap()
    }

    fn wait_until(deadline: Duration, f: impl Fn() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        f()
    }

    #[test]
    fn test_every_task_runs_exactly_once() {
        let p = pool(4, 1_000);
        const K: usize = 2_000;
        let counts: Arc<Vec<AtomicUsize>> = Arc::new((0..K).map(|_| AtomicUsize::new(0)).collect());
        for i in 0..K {
            let c = Arc::clone(&counts);
            p.enqueue(task(move || {
                c[i].fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
        }
        assert!(wait_until(Duration::from_secs(10), || p.executed() == K as u64));
        assert!(counts.iter().all(|c| c.load(Ordering::Relaxed) == 1));
        assert!(p.spawned() >= 2);
    }

    #[test]
    fn test_retire_and_respawn() {
        let p = pool(2, 20);
        let hits = Arc::new(AtomicUsize::new(0));
        let submit = |n: usize| {
            for _ in 0..n {
                let h = hits.clone();
                p.enqueue(task(move || {
                    h.fetch_add(1, Ordering::Relaxed);
                }))
                .unwrap();
            }
        };

        submit(50);
        assert!(wait_until(Duration::from_secs(5), || hits.load(Ordering::Relaxed) == 50));
        assert!(wait_until(Duration::from_secs(5), || p.running_workers() == 0));
        assert!(p.retired() >= 1);

        let spawned_before = p.spawned();
        submit(50);
        assert!(wait_until(Duration::from_secs(5), || hits.load(Ordering::Relaxed) == 100));
        assert!(p.spawned() > spawned_before);
    }

    #[test]
    fn test_nested_enqueue_from_worker() {
        let p = Arc::new(pool(2, 1_000));
        let (tx, rx) = mpsc::channel();
        let p2 = Arc::clone(&p);
        p.enqueue(task(move || {
            assert!(p2.current_worker().is_some());
            for i in 0..10 {
                let tx = tx.clone();
                p2.enqueue(task(move || tx.send(i).unwrap())).unwrap();
            }
        }))
        .unwrap();
        let mut got: Vec<i32> = (0..10).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        got.sort_unstable();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
        assert_eq!(p.current_worker(), None);
        p.shutdown();
    }

    #[test]
    fn test_shutdown_cancels_without_running() {
        let p = pool(1, 1_000);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();
        p.enqueue(task(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        }))
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let r = ran.clone();
            p.enqueue(task(move || {
                r.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
        }
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            let _ = release_tx.send(());
        });

        assert_eq!(p.shutdown(), 5);
        releaser.join().unwrap();
        assert_eq!(ran.load(Ordering::Relaxed), 0);
        assert_eq!(p.shutdown(), 0);
        assert_eq!(p.enqueue(task(|| {})), Err(ExecError::ShutDown));
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(ThreadPool::with_workers(0).is_err());
    }
}
