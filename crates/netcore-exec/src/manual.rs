//! Externally pumped executor
//!
//! Tasks accumulate until a driver runs them with `loop_once`, `loop_n` or
//! `loop_until`. Nothing runs on its own, which makes it the executor of
//! choice for deterministic tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use netcore_core::{kerror, ExecError, ExecResult, Executor, Task};

use crate::worker::run_task;

pub struct ManualExecutor {
    queue: Mutex<VecDeque<Task>>,
    cond: Condvar,
    shutdown: AtomicBool,
    /// Reported as `max_concurrency_level`
    concurrency: usize,
}

impl ManualExecutor {
    pub fn new() -> Self {
        Self::with_concurrency(1)
    }

    /// `concurrency` only shapes what the executor reports; tasks still run
    /// one at a time on the pumping thread.
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            concurrency: concurrency.max(1),
        }
    }

    /// Run the oldest queued task. `false` if the queue was empty.
    pub fn loop_once(&self) -> bool {
        let next = self.queue.lock().unwrap().pop_front();
        match next {
            Some(task) => {
                run_task(task);
                true
            }
            None => false,
        }
    }

    /// Run up to `n` tasks. Returns how many ran.
    pub fn loop_n(&self, n: usize) -> usize {
        let mut ran = 0;
        while ran < n && self.loop_once() {
            ran += 1;
        }
        ran
    }

    /// Run queued tasks, including ones they enqueue, until the queue is empty.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while self.loop_once() {
            ran += 1;
        }
        ran
    }

    /// Run tasks as they arrive until `deadline` or shutdown.
    pub fn loop_until(&self, deadline: Instant) -> usize {
        let mut ran = 0;
        loop {
            if self.loop_once() {
                ran += 1;
                continue;
            }
            let now = Instant::now();
            if now >= deadline || self.shutdown_requested() {
                return ran;
            }
            self.wait_for_task(deadline - now);
        }
    }

    /// Block until at least one task is queued, shutdown, or timeout.
    pub fn wait_for_task(&self, timeout: Duration) -> bool {
        self.wait_for_tasks(1, timeout)
    }

    /// Block until at least `n` tasks are queued. `false` on timeout or shutdown.
    pub fn wait_for_tasks(&self, n: usize, timeout: Duration) -> bool {
        let guard = self.queue.lock().unwrap();
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |q| {
                q.len() < n && !self.shutdown.load(Ordering::Acquire)
            })
            .unwrap();
        guard.len() >= n
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

impl Default for ManualExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for ManualExecutor {
    fn enqueue(&self, task: Task) -> ExecResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            kerror!("enqueue on shut down manual executor");
            return Err(ExecError::ShutDown);
        }
        self.queue.lock().unwrap().push_back(task);
        self.cond.notify_all();
        Ok(())
    }

    fn max_concurrency_level(&self) -> usize {
        self.concurrency
    }

    fn shutdown(&self) -> usize {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let cancelled = std::mem::take(&mut *self.queue.lock().unwrap());
        self.cond.notify_all();
        cancelled.len()
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcore_core::task;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    fn counter_task(c: &Arc<AtomicUsize>) -> Task {
        let c = c.clone();
        task(move || {
            c.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test]
    fn test_nothing_runs_until_pumped() {
        let ex = ManualExecutor::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            ex.enqueue(counter_task(&hits)).unwrap();
        }
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        assert_eq!(ex.pending(), 3);

        assert!(ex.loop_once());
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(ex.loop_n(5), 2);
        assert!(!ex.loop_once());
    }

    #[test]
    fn test_run_pending_follows_nested_enqueue() {
        let ex = Arc::new(ManualExecutor::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let (e, h) = (ex.clone(), hits.clone());
        ex.enqueue(task(move || {
            e.enqueue(counter_task(&h)).unwrap();
        }))
        .unwrap();
        assert_eq!(ex.run_pending(), 2);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_wait_for_tasks() {
        let ex = Arc::new(ManualExecutor::new());
        assert!(!ex.wait_for_task(Duration::from_millis(10)));

        let e = ex.clone();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            e.enqueue(task(|| {})).unwrap();
            e.enqueue(task(|| {})).unwrap();
        });
        assert!(ex.wait_for_tasks(2, Duration::from_secs(5)));
        producer.join().unwrap();
        assert_eq!(ex.loop_until(Instant::now() + Duration::from_millis(10)), 2);
    }

    #[test]
    fn test_shutdown_cancels_queued() {
        let ex = ManualExecutor::with_concurrency(4);
        assert_eq!(ex.max_concurrency_level(), 4);
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            ex.enqueue(counter_task(&hits)).unwrap();
        }
        assert_eq!(ex.shutdown(), 5);
        assert_eq!(ex.shutdown(), 0);
        assert!(!ex.loop_once());
        assert_eq!(hits.load(Ordering::Relaxed), 0);
        assert_eq!(ex.enqueue(task(|| {})), Err(ExecError::ShutDown));
    }
}
