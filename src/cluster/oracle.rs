use std::sync::atomic::{AtomicU64, Ordering};

/// Source of commit and read timestamps.
pub trait TimestampOracle: Send + Sync {
    /// Highest commit timestamp handed out so far.
    fn max_committed_ts(&self) -> u64;

    /// Allocate the next commit timestamp.
    fn next_commit_ts(&self) -> u64;

    /// Make every later timestamp greater than `ts`.
    fn bump_to(&self, ts: u64);
}

/// In-process monotonic oracle.
#[derive(Debug, Default)]
pub struct LocalOracle {
    last: AtomicU64,
}

impl LocalOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(ts: u64) -> Self {
        Self { last: AtomicU64::new(ts) }
    }
}

impl TimestampOracle for LocalOracle {
    fn max_committed_ts(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }

    fn next_commit_ts(&self) -> u64 {
        self.last.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn bump_to(&self, ts: u64) {
        self.last.fetch_max(ts, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_and_bumpable() {
        let o = LocalOracle::new();
        assert_eq!(o.next_commit_ts(), 1);
        assert_eq!(o.next_commit_ts(), 2);
        o.bump_to(100);
        assert_eq!(o.max_committed_ts(), 100);
        o.bump_to(50);
        assert_eq!(o.next_commit_ts(), 101);
    }
}
