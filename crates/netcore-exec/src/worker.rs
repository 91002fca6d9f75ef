//! Worker-thread plumbing shared by `WorkerThread` and `ThreadPool`
//!
//! Each executor thread owns a private queue kept in thread-local storage,
//! so only that thread touches it and no lock is needed. Other threads feed
//! it through the mutex-guarded public queue of its `WorkerCore`; the worker
//! swaps the whole public queue into the private one in a single short
//! critical section and then drains privately.

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use netcore_core::{kerror, Task};

use crate::semaphore::Semaphore;

struct Local {
    /// Executor instance this thread belongs to
    owner: usize,
    /// Worker index within the owner
    index: usize,
    private: VecDeque<Task>,
}

thread_local! {
    static CURRENT: RefCell<Option<Local>> = const { RefCell::new(None) };
}

static NEXT_OWNER: AtomicUsize = AtomicUsize::new(1);

/// Unique id for an executor instance.
pub(crate) fn next_owner_id() -> usize {
    NEXT_OWNER.fetch_add(1, Ordering::Relaxed)
}

/// Mark the calling thread as worker `index` of executor `owner`.
pub(crate) fn bind_current(owner: usize, index: usize) {
    CURRENT.with(|c| {
        *c.borrow_mut() = Some(Local {
            owner,
            index,
            private: VecDeque::new(),
        });
    });
}

/// Unbind the calling thread, returning whatever was left in its private queue.
pub(crate) fn unbind_current() -> VecDeque<Task> {
    CURRENT.with(|c| c.borrow_mut().take().map(|l| l.private).unwrap_or_default())
}

/// Worker index of the calling thread if it belongs to `owner`.
pub(crate) fn current_index(owner: usize) -> Option<usize> {
    CURRENT.with(|c| match &*c.borrow() {
        Some(l) if l.owner == owner => Some(l.index),
        _ => None,
    })
}

/// Append to the caller's private queue if the caller is one of `owner`'s
/// workers (and, with `only_if_empty`, its private queue is empty).
/// Hands the task back otherwise.
pub(crate) fn try_push_local(owner: usize, task: Task, only_if_empty: bool) -> Result<(), Task> {
    CURRENT.with(|c| match &mut *c.borrow_mut() {
        Some(l) if l.owner == owner && (!only_if_empty || l.private.is_empty()) => {
            l.private.push_back(task);
            Ok(())
        }
        _ => Err(task),
    })
}

/// Next task from the caller's private queue. The borrow is released before
/// the task runs, so running tasks may enqueue again.
pub(crate) fn pop_local() -> Option<Task> {
    CURRENT.with(|c| c.borrow_mut().as_mut().and_then(|l| l.private.pop_front()))
}

pub(crate) fn local_len() -> usize {
    CURRENT.with(|c| c.borrow().as_ref().map_or(0, |l| l.private.len()))
}

/// Run `f` on the caller's private queue. `None` if the thread is unbound.
pub(crate) fn with_private<R>(f: impl FnOnce(&mut VecDeque<Task>) -> R) -> Option<R> {
    CURRENT.with(|c| c.borrow_mut().as_mut().map(|l| f(&mut l.private)))
}

/// Public half of a worker: queue fed by other threads plus its wake semaphore.
pub(crate) struct WorkerCore {
    public: Mutex<VecDeque<Task>>,
    sem: Semaphore,
}

impl WorkerCore {
    pub(crate) fn new() -> Self {
        Self {
            public: Mutex::new(VecDeque::new()),
            sem: Semaphore::new(0),
        }
    }

    /// Push one task; wakes the worker on the empty to non-empty transition.
    pub(crate) fn push(&self, task: Task) {
        let was_empty = {
            let mut q = self.public.lock().unwrap();
            let was_empty = q.is_empty();
            q.push_back(task);
            was_empty
        };
        if was_empty {
            self.sem.release(1);
        }
    }

    pub(crate) fn push_many(&self, tasks: VecDeque<Task>) {
        if tasks.is_empty() {
            return;
        }
        let was_empty = {
            let mut q = self.public.lock().unwrap();
            let was_empty = q.is_empty();
            q.extend(tasks);
            was_empty
        };
        if was_empty {
            self.sem.release(1);
        }
    }

    /// Move the whole public queue into `private`. Returns the number moved.
    pub(crate) fn take_into(&self, private: &mut VecDeque<Task>) -> usize {
        let mut q = self.public.lock().unwrap();
        let moved = q.len();
        if moved == 0 {
            return 0;
        }
        if private.is_empty() {
            std::mem::swap(&mut *q, private);
        } else {
            private.append(&mut q);
        }
        // Stale permits would only cause spurious wakeups later.
        while self.sem.try_acquire() {}
        moved
    }

    pub(crate) fn has_public(&self) -> bool {
        !self.public.lock().unwrap().is_empty()
    }

    /// Drop every queued task without running it. Returns how many were dropped.
    pub(crate) fn drain_public(&self) -> usize {
        let drained = std::mem::take(&mut *self.public.lock().unwrap());
        drained.len()
    }

    /// Block until woken or `timeout` elapses. `false` on timeout.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> bool {
        self.sem.acquire_timeout(timeout)
    }

    pub(crate) fn wake(&self) {
        self.sem.release(1);
    }
}

/// Run a task, containing panics so one bad task does not kill the worker.
pub(crate) fn run_task(task: Task) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(()) => true,
        Err(_) => {
            kerror!("task panicked");
            false
        }
    }
}

/// Join `handle` unless it is the calling thread (a task shutting down its
/// own executor); that thread exits on its own after the current task.
pub(crate) fn join_unless_current(handle: JoinHandle<()>) {
    if handle.thread().id() == thread::current().id() {
        return;
    }
    let _ = handle.join();
}

/// Per-thread hash used to spread idle-worker searches.
pub(crate) fn thread_hint() -> usize {
    let mut h = DefaultHasher::new();
    thread::current().id().hash(&mut h);
    h.finish() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcore_core::task;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_local_queue_is_per_owner() {
        bind_current(11, 3);
        assert_eq!(current_index(11), Some(3));
        assert_eq!(current_index(12), None);

        assert!(try_push_local(11, task(|| {}), true).is_ok());
        // Not empty anymore
        assert!(try_push_local(11, task(|| {}), true).is_err());
        assert!(try_push_local(11, task(|| {}), false).is_ok());
        assert!(try_push_local(12, task(|| {}), false).is_err());
        assert_eq!(local_len(), 2);

        assert!(pop_local().is_some());
        let left = unbind_current();
        assert_eq!(left.len(), 1);
        assert_eq!(current_index(11), None);
        assert!(pop_local().is_none());
    }

    #[test]
    fn test_core_swap_and_wake() {
        let core = WorkerCore::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let h = hits.clone();
            core.push(task(move || {
                h.fetch_add(1, Ordering::Relaxed);
            }));
        }
        // Exactly one wake for the empty -> non-empty transition
        assert!(core.wait(Some(Duration::from_millis(10))));
        assert!(!core.wait(Some(Duration::from_millis(10))));

        let mut private = VecDeque::new();
        assert_eq!(core.take_into(&mut private), 3);
        assert!(!core.has_public());
        for t in private {
            run_task(t);
        }
        assert_eq!(hits.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_drain_public_counts() {
        let core = WorkerCore::new();
        core.push_many((0..4).map(|_| task(|| {})).collect());
        assert_eq!(core.drain_public(), 4);
        assert_eq!(core.drain_public(), 0);
    }

    #[test]
    fn test_run_task_contains_panic() {
        assert!(!run_task(task(|| panic!("boom"))));
        assert!(run_task(task(|| {})));
    }
}
