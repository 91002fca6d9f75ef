//! Idle worker hint set
//!
//! One atomic flag per pool worker plus an approximate idle count. Used to
//! pick a target for foreign enqueues and donation peers. Correctness never
//! depends on it: a stale flag only costs a less balanced placement.

use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};

pub struct IdleWorkerSet {
    flags: Box<[AtomicBool]>,
    /// Approximate number of set flags (may briefly go stale)
    count: AtomicIsize,
}

impl IdleWorkerSet {
    /// `initially_idle` marks every worker idle (workers that have not been
    /// spawned yet count as idle).
    pub fn new(workers: usize, initially_idle: bool) -> Self {
        let flags = (0..workers)
            .map(|_| AtomicBool::new(initially_idle))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let count = if initially_idle { workers as isize } else { 0 };
        Self {
            flags,
            count: AtomicIsize::new(count),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn set_idle(&self, index: usize) {
        if !self.flags[index].swap(true, Ordering::AcqRel) {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_busy(&self, index: usize) {
        if self.flags[index].swap(false, Ordering::AcqRel) {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn is_idle(&self, index: usize) -> bool {
        self.flags[index].load(Ordering::Acquire)
    }

    /// Approximate idle count (never negative).
    #[inline]
    pub fn approx_idle(&self) -> usize {
        self.count.load(Ordering::Relaxed).max(0) as usize
    }

    /// Claim one idle worker, scanning from `hint`.
    ///
    /// A claimed worker's flag is cleared so concurrent callers spread out.
    pub fn find_idle_worker(&self, hint: usize) -> Option<usize> {
        let n = self.flags.len();
        if n == 0 || self.count.load(Ordering::Relaxed) <= 0 {
            return None;
        }
        let start = hint % n;
        for step in 0..n {
            let i = (start + step) % n;
            let flag = &self.flags[i];
            if flag.load(Ordering::Relaxed)
                && flag
                    .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                self.count.fetch_sub(1, Ordering::Relaxed);
                return Some(i);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claims_are_exclusive() {
        let set = IdleWorkerSet::new(3, true);
        let mut got = vec![
            set.find_idle_worker(7).unwrap(),
            set.find_idle_worker(7).unwrap(),
            set.find_idle_worker(7).unwrap(),
        ];
        got.sort_unstable();
        assert_eq!(got, vec![0, 1, 2]);
        assert_eq!(set.find_idle_worker(0), None);
        assert_eq!(set.approx_idle(), 0);
    }

    #[test]
    fn test_hint_picks_start() {
        let set = IdleWorkerSet::new(4, true);
        assert_eq!(set.find_idle_worker(6), Some(2));
        assert_eq!(set.find_idle_worker(6), Some(3));
    }

    #[test]
    fn test_idle_busy_transitions() {
        let set = IdleWorkerSet::new(2, false);
        assert_eq!(set.find_idle_worker(0), None);
        set.set_idle(1);
        set.set_idle(1);
        assert_eq!(set.approx_idle(), 1);
        assert!(set.is_idle(1));
        set.set_busy(1);
        set.set_busy(1);
        assert_eq!(set.approx_idle(), 0);
        assert!(!set.is_idle(1));
    }
}
