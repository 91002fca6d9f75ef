//! Futex-backed counting semaphore
//!
//! The futex word is the permit count itself. A waiter sleeps with
//! `FUTEX_WAIT` on value 0; the kernel re-checks the word atomically, so a
//! release that lands between the failed `try_acquire` and the wait makes
//! the wait return immediately with `EAGAIN`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

pub struct FutexSemaphore {
    /// Available permits (futex word)
    count: AtomicU32,

    /// Threads inside `FUTEX_WAIT` (lets `release` skip the syscall)
    waiters: AtomicU32,
}

impl FutexSemaphore {
    pub fn new(permits: u32) -> Self {
        Self {
            count: AtomicU32::new(permits),
            waiters: AtomicU32::new(0),
        }
    }

    /// Add `n` permits and wake up to `n` waiters.
    pub fn release(&self, n: u32) {
        if n == 0 {
            return;
        }
        self.count.fetch_add(n, Ordering::SeqCst);
        if self.waiters.load(Ordering::SeqCst) == 0 {
            return;
        }
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                self.count.as_ptr(),
                libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
                n.min(i32::MAX as u32) as i32,
                std::ptr::null::<libc::timespec>(),
                std::ptr::null::<u32>(),
                0u32,
            );
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut current = self.count.load(Ordering::SeqCst);
        while current > 0 {
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Take one permit, waiting up to `timeout` (`None` = forever).
    ///
    /// Returns `false` on timeout.
    pub fn acquire_timeout(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.try_acquire() {
                return true;
            }

            let remaining = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return false;
                    }
                    Some(d - now)
                }
                None => None,
            };

            let timespec = remaining.map(|d| libc::timespec {
                tv_sec: d.as_secs() as libc::time_t,
                tv_nsec: d.subsec_nanos() as libc::c_long,
            });
            let timespec_ptr = match &timespec {
                Some(ts) => ts as *const libc::timespec,
                None => std::ptr::null(),
            };

            self.waiters.fetch_add(1, Ordering::SeqCst);
            // Sleep only while the count is 0. ETIMEDOUT, EAGAIN and EINTR
            // all lead back to the re-check at the top of the loop.
            unsafe {
                libc::syscall(
                    libc::SYS_futex,
                    self.count.as_ptr(),
                    libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                    0u32,
                    timespec_ptr,
                    std::ptr::null::<u32>(),
                    0u32,
                );
            }
            self.waiters.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Permits currently available (racy snapshot).
    pub fn available(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for FutexSemaphore {
    fn default() -> Self {
        Self::new(0)
    }
}
