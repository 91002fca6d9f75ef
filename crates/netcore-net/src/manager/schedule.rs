//! Per-connection work scheduling
//!
//! At most one work item per id is queued or running. Parallelism across
//! ids is capped at `max_working`; ids over the cap wait in FIFO order and
//! are picked up by running slots or topped up by the reactor.
//!
//! ```text
//!   admit(id):  absent  ──► working < max ? Launch : Deferred (→ waiting)
//!               Queued  ──► Duplicate
//!               Running ──► rerun = true, Duplicate
//!
//!   complete(id, again): rerun || again ─► back of waiting
//!                        then hand the slot to the next waiting id
//! ```
//!
//! An id removed while it is queued or running is marked retired. Its next
//! completion (or abort) drops it instead of requeueing and reports it for
//! reclaim, so the table never reuses an id a work pass still holds.

use std::collections::{HashMap, HashSet, VecDeque};

use netcore_core::ConnId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Queued,
    Running { rerun: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admit {
    /// Already queued or running; nothing to do
    Duplicate,
    /// Over budget; waiting for a slot
    Deferred,
    /// A slot was reserved; the caller must launch a task for it
    Launch,
}

/// Outcome of [`WorkQueue::complete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Completed {
    /// Waiting id handed to the same slot
    pub next: Option<ConnId>,
    /// Retired id whose last pass just ended
    pub reclaim: Option<ConnId>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleStats {
    pub pending: usize,
    pub waiting: usize,
    pub working: usize,
    pub max_working: usize,
    /// Removed ids still held by a queued or running pass
    pub retired: usize,
}

pub(crate) struct WorkQueue {
    pending: HashMap<ConnId, Pending>,
    retired: HashSet<ConnId>,
    waiting: VecDeque<ConnId>,
    working: usize,
    max_working: usize,
}

impl WorkQueue {
    pub(crate) fn new(max_working: usize) -> Self {
        Self {
            pending: HashMap::new(),
            retired: HashSet::new(),
            waiting: VecDeque::new(),
            working: 0,
            max_working: max_working.max(1),
        }
    }

    pub(crate) fn admit(&mut self, id: ConnId) -> Admit {
        match self.pending.get_mut(&id) {
            Some(Pending::Queued) => return Admit::Duplicate,
            Some(Pending::Running { rerun }) => {
                *rerun = true;
                return Admit::Duplicate;
            }
            None => {}
        }
        self.pending.insert(id, Pending::Queued);
        if self.working < self.max_working {
            self.working += 1;
            Admit::Launch
        } else {
            self.waiting.push_back(id);
            Admit::Deferred
        }
    }

    pub(crate) fn begin(&mut self, id: ConnId) {
        self.pending.insert(id, Pending::Running { rerun: false });
    }

    /// Mark `id` removed. Returns `true` if a queued or running pass still
    /// holds it; the id then comes back from `complete` or `abort` for
    /// reclaim. Returns `false` if it can be reclaimed now.
    pub(crate) fn retire(&mut self, id: ConnId) -> bool {
        if self.pending.contains_key(&id) {
            self.retired.insert(id);
            true
        } else {
            false
        }
    }

    /// Finish a pass on `id`. With `may_continue` the slot is kept and the
    /// next waiting id is returned; otherwise (or with nothing waiting) the
    /// slot is released.
    pub(crate) fn complete(&mut self, id: ConnId, again: bool, may_continue: bool) -> Completed {
        let rerun = matches!(self.pending.remove(&id), Some(Pending::Running { rerun: true }));
        let reclaim = self.retired.remove(&id).then_some(id);
        if reclaim.is_none() && (rerun || again) {
            self.pending.insert(id, Pending::Queued);
            self.waiting.push_back(id);
        }
        if may_continue {
            if let Some(next) = self.waiting.pop_front() {
                return Completed { next: Some(next), reclaim };
            }
        }
        self.working -= 1;
        Completed { next: None, reclaim }
    }

    /// Reserve slots for waiting ids while under budget.
    pub(crate) fn take_launchable(&mut self) -> Vec<ConnId> {
        let mut out = Vec::new();
        while self.working < self.max_working {
            match self.waiting.pop_front() {
                Some(id) => {
                    self.working += 1;
                    out.push(id);
                }
                None => break,
            }
        }
        out
    }

    /// A reserved slot could not be launched. Returns `true` if `id` was
    /// retired and must now be reclaimed.
    pub(crate) fn abort(&mut self, id: ConnId) -> bool {
        self.pending.remove(&id);
        self.working = self.working.saturating_sub(1);
        self.retired.remove(&id)
    }

    /// Forget all queued work; returns the retired ids to reclaim.
    pub(crate) fn clear(&mut self) -> Vec<ConnId> {
        self.pending.clear();
        self.waiting.clear();
        self.retired.drain().collect()
    }

    pub(crate) fn stats(&self) -> ScheduleStats {
        ScheduleStats {
            pending: self.pending.len(),
            waiting: self.waiting.len(),
            working: self.working,
            max_working: self.max_working,
            retired: self.retired.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> ConnId {
        ConnId::new(n).unwrap()
    }

    #[test]
    fn test_duplicate_and_rerun() {
        let mut q = WorkQueue::new(4);
        assert_eq!(q.admit(id(1)), Admit::Launch);
        assert_eq!(q.admit(id(1)), Admit::Duplicate);

        q.begin(id(1));
        assert_eq!(q.admit(id(1)), Admit::Duplicate);
        // rerun requested while running: back on the waiting list
        assert_eq!(q.complete(id(1), false, true).next, Some(id(1)));
        q.begin(id(1));
        assert_eq!(q.complete(id(1), false, true), Completed { next: None, reclaim: None });
        assert_eq!(
            q.stats(),
            ScheduleStats { pending: 0, waiting: 0, working: 0, max_working: 4, retired: 0 }
        );
    }

    #[test]
    fn test_budget_defers_in_fifo_order() {
        let mut q = WorkQueue::new(2);
        assert_eq!(q.admit(id(1)), Admit::Launch);
        assert_eq!(q.admit(id(2)), Admit::Launch);
        assert_eq!(q.admit(id(3)), Admit::Deferred);
        assert_eq!(q.admit(id(4)), Admit::Deferred);
        assert!(q.take_launchable().is_empty());

        q.begin(id(1));
        assert_eq!(q.complete(id(1), false, true).next, Some(id(3)));
        q.begin(id(2));
        assert_eq!(q.complete(id(2), false, false).next, None);
        assert_eq!(q.take_launchable(), vec![id(4)]);
        assert_eq!(q.stats().working, 2);
    }

    #[test]
    fn test_not_idle_requeues_and_abort_frees_slot() {
        let mut q = WorkQueue::new(1);
        assert_eq!(q.admit(id(7)), Admit::Launch);
        q.begin(id(7));
        assert_eq!(q.complete(id(7), true, false).next, None);
        assert_eq!(q.stats().waiting, 1);
        assert_eq!(q.take_launchable(), vec![id(7)]);
        assert!(!q.abort(id(7)));
        assert_eq!(q.stats().working, 0);
        assert_eq!(q.stats().pending, 0);
    }

    #[test]
    fn test_retired_while_running_is_reclaimed_at_completion() {
        let mut q = WorkQueue::new(2);
        assert!(!q.retire(id(1)));

        assert_eq!(q.admit(id(1)), Admit::Launch);
        q.begin(id(1));
        assert_eq!(q.admit(id(1)), Admit::Duplicate);
        assert!(q.retire(id(1)));
        assert_eq!(q.stats().retired, 1);

        // rerun and again are both dropped for a retired id
        assert_eq!(q.complete(id(1), true, true), Completed { next: None, reclaim: Some(id(1)) });
        assert_eq!(q.stats(), ScheduleStats { max_working: 2, ..ScheduleStats::default() });
    }

    #[test]
    fn test_retired_while_waiting() {
        let mut q = WorkQueue::new(1);
        assert_eq!(q.admit(id(1)), Admit::Launch);
        assert_eq!(q.admit(id(2)), Admit::Deferred);
        assert!(q.retire(id(2)));

        q.begin(id(1));
        let done = q.complete(id(1), false, true);
        assert_eq!(done, Completed { next: Some(id(2)), reclaim: None });
        q.begin(id(2));
        assert_eq!(q.complete(id(2), false, true).reclaim, Some(id(2)));

        assert_eq!(q.admit(id(3)), Admit::Launch);
        assert!(q.retire(id(3)));
        assert_eq!(q.clear(), vec![id(3)]);
    }
}
