//! Counting semaphore used to park executor threads
//!
//! Permits are released by producers when a worker's public queue goes
//! from empty to non-empty, and consumed by the worker before it swaps the
//! queue. A permit released while nobody waits is kept, so a wake that
//! races with the worker going to sleep is never lost.
//!
//! Platform-specific implementations:
//! - Linux: futex on the permit counter
//! - Others: `Mutex<u32>` + `Condvar`

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod futex_linux;
        pub use futex_linux::FutexSemaphore as Semaphore;
    } else {
        mod fallback;
        pub use fallback::CondvarSemaphore as Semaphore;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_permits_are_counted() {
        let sem = Semaphore::new(0);
        assert!(!sem.try_acquire());
        sem.release(2);
        assert_eq!(sem.available(), 2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
    }

    #[test]
    fn test_acquire_times_out() {
        let sem = Semaphore::new(0);
        let start = Instant::now();
        assert!(!sem.acquire_timeout(Some(Duration::from_millis(20))));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_release_wakes_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let s = sem.clone();
        let waiter = thread::spawn(move || s.acquire_timeout(Some(Duration::from_secs(5))));

        thread::sleep(Duration::from_millis(20));
        sem.release(1);
        assert!(waiter.join().unwrap());
        assert_eq!(sem.available(), 0);
    }

    #[test]
    fn test_release_before_wait_is_kept() {
        let sem = Semaphore::new(0);
        sem.release(1);
        assert!(sem.acquire_timeout(None));
    }
}
