//! Copy-on-write connection id set
//!
//! Writers clone the set, modify the clone and install it under a short
//! write lock. Readers clone the `Arc` and iterate without any lock held,
//! so `broadcast`/`foreach` never see a container mid-mutation.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use crate::id::ConnId;

#[derive(Debug, Default)]
pub struct CowIdSet {
    inner: RwLock<Arc<BTreeSet<ConnId>>>,
}

impl CowIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current published set.
    pub fn snapshot(&self) -> Arc<BTreeSet<ConnId>> {
        self.inner.read().unwrap().clone()
    }

    /// Returns `false` if the id was already present.
    pub fn insert(&self, id: ConnId) -> bool {
        self.update(|set| set.insert(id))
    }

    /// Returns `false` if the id was absent.
    pub fn remove(&self, id: ConnId) -> bool {
        self.update(|set| set.remove(&id))
    }

    pub fn clear(&self) {
        *self.inner.write().unwrap() = Arc::new(BTreeSet::new());
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.inner.read().unwrap().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update(&self, f: impl FnOnce(&mut BTreeSet<ConnId>) -> bool) -> bool {
        let mut guard = self.inner.write().unwrap();
        let mut next = BTreeSet::clone(&guard);
        let changed = f(&mut next);
        if changed {
            *guard = Arc::new(next);
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> ConnId {
        ConnId::new(n).unwrap()
    }

    #[test]
    fn test_snapshot_is_stable_across_mutation() {
        let set = CowIdSet::new();
        set.insert(id(1));
        set.insert(id(2));

        let snap = set.snapshot();
        set.remove(id(1));
        set.insert(id(3));

        assert_eq!(snap.iter().copied().collect::<Vec<_>>(), vec![id(1), id(2)]);
        assert_eq!(set.snapshot().iter().copied().collect::<Vec<_>>(), vec![id(2), id(3)]);
    }

    #[test]
    fn test_insert_remove_report_change() {
        let set = CowIdSet::new();
        assert!(set.insert(id(5)));
        assert!(!set.insert(id(5)));
        assert!(set.contains(id(5)));
        assert!(set.remove(id(5)));
        assert!(!set.remove(id(5)));
        assert!(set.is_empty());
    }

    #[test]
    fn test_unchanged_update_keeps_same_arc() {
        let set = CowIdSet::new();
        set.insert(id(1));
        let a = set.snapshot();
        set.insert(id(1));
        assert!(Arc::ptr_eq(&a, &set.snapshot()));
    }
}
