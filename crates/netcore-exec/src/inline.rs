//! Executor that runs every task on the calling thread

use std::sync::atomic::{AtomicBool, Ordering};

use netcore_core::{kerror, ExecError, ExecResult, Executor, Task};

use crate::worker::run_task;

#[derive(Debug, Default)]
pub struct InlineExecutor {
    shutdown: AtomicBool,
}

impl InlineExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Executor for InlineExecutor {
    fn enqueue(&self, task: Task) -> ExecResult<()> {
        if self.shutdown.load(Ordering::Acquire) {
            kerror!("enqueue on shut down inline executor");
            return Err(ExecError::ShutDown);
        }
        run_task(task);
        Ok(())
    }

    fn max_concurrency_level(&self) -> usize {
        1
    }

    fn shutdown(&self) -> usize {
        self.shutdown.store(true, Ordering::Release);
        0
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

    #[test]
    fn test_runs_synchronously() {
        let ex = InlineExecutor::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        ex.enqueue(task(move || {
            h.fetch_add(1, Ordering::Relaxed);
        }))
        .unwrap();
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_shutdown_rejects() {
        let ex = InlineExecutor::new();
        assert_eq!(ex.shutdown(), 0);
        assert_eq!(ex.shutdown(), 0);
        assert!(ex.shutdown_requested());
        assert_eq!(ex.enqueue(task(|| {})), Err(ExecError::ShutDown));
    }
}
