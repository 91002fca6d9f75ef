//! Condvar-backed counting semaphore for targets without futex

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub struct CondvarSemaphore {
    count: Mutex<u32>,
    condvar: Condvar,
}

impl CondvarSemaphore {
    pub fn new(permits: u32) -> Self {
        Self {
            count: Mutex::new(permits),
            condvar: Condvar::new(),
        }
    }

    pub fn release(&self, n: u32) {
        if n == 0 {
            return;
        }
        let mut count = self.count.lock().unwrap();
        *count = count.saturating_add(n);
        drop(count);
        if n == 1 {
            self.condvar.notify_one();
        } else {
            self.condvar.notify_all();
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    pub fn acquire_timeout(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return false;
                    }
                    self.condvar.wait_timeout(count, d - now).unwrap().0
                }
                None => self.condvar.wait(count).unwrap(),
            };
        }
        *count -= 1;
        true
    }

    pub fn available(&self) -> u32 {
        *self.count.lock().unwrap()
    }
}

impl Default for CondvarSemaphore {
    fn default() -> Self {
        Self::new(0)
    }
}
