//! Work items and the executor abstraction

use crate::error::ExecResult;

/// Move-only, single-invocation work item.
///
/// Results, if any, travel out-of-band (channels, atomics, shared state).
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Box a closure as a [`Task`].
#[inline]
pub fn task<F>(f: F) -> Task
where
    F: FnOnce() + Send + 'static,
{
    Box::new(f)
}

/// Scheduler for [`Task`]s.
///
/// Implementations: `InlineExecutor`, `ManualExecutor`, `ThreadExecutor`,
/// `WorkerThread` and `ThreadPool` in `netcore-exec`.
pub trait Executor: Send + Sync {
    /// Schedule one task.
    ///
    /// Fails with `ExecError::ShutDown` after `shutdown()`; the task is
    /// dropped without running.
    fn enqueue(&self, task: Task) -> ExecResult<()>;

    /// Schedule several tasks. Stops at the first failure.
    fn enqueue_batch(&self, tasks: Vec<Task>) -> ExecResult<()> {
        for t in tasks {
            self.enqueue(t)?;
        }
        Ok(())
    }

    /// How many tasks may run at the same time.
    fn max_concurrency_level(&self) -> usize;

    /// Stop accepting work, drop queued tasks and join owned threads.
    ///
    /// Idempotent. Returns the number of tasks cancelled by this call.
    fn shutdown(&self) -> usize;

    fn shutdown_requested(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting {
        ran: AtomicUsize,
        down: AtomicBool,
    }

    impl Executor for Counting {
        fn enqueue(&self, task: Task) -> ExecResult<()> {
            if self.down.load(Ordering::Acquire) {
                return Err(ExecError::ShutDown);
            }
            task();
            self.ran.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        fn max_concurrency_level(&self) -> usize {
            1
        }
        fn shutdown(&self) -> usize {
            self.down.store(true, Ordering::Release);
            0
        }
        fn shutdown_requested(&self) -> bool {
            self.down.load(Ordering::Acquire)
        }
    }

    #[test]
    fn test_default_enqueue_batch() {
        let ex = Counting { ran: AtomicUsize::new(0), down: AtomicBool::new(false) };
        let hits = Arc::new(AtomicUsize::new(0));
        let batch: Vec<Task> = (0..5)
            .map(|_| {
                let h = hits.clone();
                task(move || {
                    h.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();
        ex.enqueue_batch(batch).unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 5);
        assert_eq!(ex.ran.load(Ordering::Relaxed), 5);

        ex.shutdown();
        assert_eq!(ex.enqueue(task(|| {})), Err(ExecError::ShutDown));
    }
}
