//! Connection arena
//!
//! Slots are indexed by `id - 1` and never reallocated; a freed id goes to
//! an ordered free set so the lowest id is reused first. Freeing is two
//! steps: `retire` takes the id out of service and `reclaim` makes it
//! allocatable, which the manager delays while a work pass still holds the
//! slot. Guarded by the manager mutex.

use std::collections::BTreeSet;
use std::sync::Arc;

use netcore_core::ConnId;

use crate::connection::Connection;

pub(crate) struct ConnTable {
    slots: Vec<Arc<Connection>>,
    live: Vec<bool>,
    free: BTreeSet<ConnId>,
    live_count: usize,
    max_count: u32,
}

impl ConnTable {
    pub(crate) fn new(reserve: u32, max_count: u32) -> Self {
        Self {
            slots: Vec::with_capacity(reserve as usize),
            live: Vec::with_capacity(reserve as usize),
            free: BTreeSet::new(),
            live_count: 0,
            max_count,
        }
    }

    /// No free id and the table cannot grow.
    pub(crate) fn is_full(&self) -> bool {
        self.free.is_empty() && self.max_id() >= self.max_count
    }

    /// Claim the lowest free id, or grow the table with `make`.
    pub(crate) fn allocate(&mut self, make: impl FnOnce(ConnId) -> Connection) -> Option<Arc<Connection>> {
        let id = match self.free.pop_first() {
            Some(id) => id,
            None => {
                if self.max_id() >= self.max_count {
                    return None;
                }
                let id = ConnId::from_index(self.slots.len())?;
                self.slots.push(Arc::new(make(id)));
                self.live.push(false);
                id
            }
        };
        self.live[id.index()] = true;
        self.live_count += 1;
        Some(self.slots[id.index()].clone())
    }

    /// Take `id` out of service if it is still held by `generation`.
    /// Returns `false` when the slot was already retired or reused. The id
    /// is not allocatable until [`reclaim`](Self::reclaim).
    pub(crate) fn retire(&mut self, id: ConnId, generation: u32) -> bool {
        let idx = id.index();
        if idx >= self.slots.len() || !self.live[idx] || self.slots[idx].generation() != generation {
            return false;
        }
        self.live[idx] = false;
        self.live_count -= 1;
        true
    }

    /// Return a retired id to the free set.
    pub(crate) fn reclaim(&mut self, id: ConnId) {
        if id.index() < self.slots.len() && !self.live[id.index()] {
            self.free.insert(id);
        }
    }

    pub(crate) fn get(&self, id: ConnId) -> Option<&Arc<Connection>> {
        self.slots.get(id.index())
    }

    pub(crate) fn get_live(&self, id: ConnId) -> Option<Arc<Connection>> {
        if self.is_live(id) {
            self.slots.get(id.index()).cloned()
        } else {
            None
        }
    }

    pub(crate) fn is_live(&self, id: ConnId) -> bool {
        self.live.get(id.index()).copied().unwrap_or(false)
    }

    /// Highest id ever handed out.
    pub(crate) fn max_id(&self) -> u32 {
        self.slots.len() as u32
    }

    pub(crate) fn len(&self) -> usize {
        self.live_count
    }

    pub(crate) fn live_connections(&self) -> Vec<Arc<Connection>> {
        self.slots
            .iter()
            .zip(&self.live)
            .filter(|(_, live)| **live)
            .map(|(c, _)| c.clone())
            .collect()
    }
}
