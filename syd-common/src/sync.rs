//! Blocking synchronization helpers for cross-worker completion barriers.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Counting semaphore used to wait for task completions posted by worker threads.
///
/// `std::sync` has no semaphore, so this is the classic mutex-plus-condvar formulation. The
/// permit count never goes negative; `wait` blocks until a permit is available.
#[derive(Debug, Default)]
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Creates a semaphore holding `permits` initial permits.
    #[must_use]
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Releases one permit.
    pub fn post(&self) {
        self.post_n(1);
    }

    /// Releases `count` permits at once.
    pub fn post_n(&self, count: usize) {
        if count == 0 {
            return;
        }
        let mut permits = self.permits.lock().expect("semaphore mutex must not be poisoned");
        *permits = permits.saturating_add(count);
        self.available.notify_all();
    }

    /// Blocks until one permit is available and consumes it.
    pub fn wait(&self) {
        let mut permits = self.permits.lock().expect("semaphore mutex must not be poisoned");
        while *permits == 0 {
            permits = self
                .available
                .wait(permits)
                .expect("semaphore mutex must not be poisoned");
        }
        *permits -= 1;
    }

    /// Blocks until `count` permits have been consumed and returns `count`.
    pub fn wait_n(&self, count: usize) -> usize {
        for _ in 0..count {
            self.wait();
        }
        count
    }

    /// Waits for one permit up to `timeout`; returns whether a permit was consumed.
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        let mut permits = self.permits.lock().expect("semaphore mutex must not be poisoned");
        while *permits == 0 {
            let (guard, result) = self
                .available
                .wait_timeout(permits, timeout)
                .expect("semaphore mutex must not be poisoned");
            permits = guard;
            if result.timed_out() && *permits == 0 {
                return false;
            }
        }
        *permits -= 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::Semaphore;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::time::Duration;

    #[rstest]
    fn semaphore_counts_posts_and_waits() {
        let sem = Semaphore::new(0);
        sem.post_n(3);
        assert_that!(sem.wait_n(3), eq(3_usize));
        assert_that!(sem.timed_wait(Duration::from_millis(10)), eq(false));
    }

    #[rstest]
    fn semaphore_wakes_blocked_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let posting = Arc::clone(&sem);
        let waiter = std::thread::spawn(move || {
            posting.wait();
            true
        });
        sem.post();
        assert_that!(waiter.join().expect("waiter thread must not panic"), eq(true));
    }

    #[rstest]
    fn timed_wait_consumes_available_permit() {
        let sem = Semaphore::new(1);
        assert_that!(sem.timed_wait(Duration::from_millis(10)), eq(true));
        assert_that!(sem.timed_wait(Duration::from_millis(10)), eq(false));
    }
}
