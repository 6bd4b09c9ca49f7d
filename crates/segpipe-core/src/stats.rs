//! Per-segment execution counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Snapshot of one segment's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SegmentStats {
    /// Executor invocations, successful or not.
    pub invocations: u64,
    /// Invocations that produced an error marker.
    pub failures: u64,
    /// Cumulative time spent inside the executor.
    pub total_time: Duration,
}

impl SegmentStats {
    /// Mean executor time per invocation.
    pub fn mean_time(&self) -> Duration {
        if self.invocations == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total_time.as_nanos() / u128::from(self.invocations);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// Lock-free counters updated by a worker and read by the runner.
#[derive(Debug, Default)]
pub(crate) struct SegmentCounters {
    invocations: AtomicU64,
    failures: AtomicU64,
    total_nanos: AtomicU64,
}

impl SegmentCounters {
    pub(crate) fn record(&self, elapsed: Duration, failed: bool) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.invocations.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> SegmentStats {
        SegmentStats {
            invocations: self.invocations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            total_time: Duration::from_nanos(self.total_nanos.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_record_and_snapshot() {
        let counters = SegmentCounters::default();
        counters.record(Duration::from_millis(10), false);
        counters.record(Duration::from_millis(30), true);

        let stats = counters.snapshot();
        assert_eq!(stats.invocations, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.total_time, Duration::from_millis(40));
        assert_eq!(stats.mean_time(), Duration::from_millis(20));
    }

    #[test]
    fn test_mean_of_nothing_is_zero() {
        assert_eq!(SegmentStats::default().mean_time(), Duration::ZERO);
    }
}
