//! Canonical identifier types used across the worker runtime.

/// Numeric worker identifier inside a single process.
///
/// Ids are assigned at pool construction time and are dense and contiguous starting from zero.
pub type WorkerId = usize;

/// 64-bit session identifier, unique across all workers of one process.
pub type SessionId = u64;

/// Strongly typed worker-count wrapper to avoid passing raw integers around runtime APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerCount(usize);

impl WorkerCount {
    /// Creates a validated worker-count value.
    ///
    /// Returns `None` for zero because the routing runtime always requires at least one worker.
    #[must_use]
    pub fn new(value: usize) -> Option<Self> {
        if value == 0 { None } else { Some(Self(value)) }
    }

    /// Returns the inner count.
    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::WorkerCount;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn worker_count_rejects_zero() {
        assert_that!(WorkerCount::new(0), eq(None));
    }

    #[rstest]
    #[case(1)]
    #[case(8)]
    #[case(1024)]
    fn worker_count_accepts_positive_values(#[case] input: usize) {
        let count = WorkerCount::new(input).expect("positive count must be valid");
        assert_that!(count.get(), eq(input));
    }
}
