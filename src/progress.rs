use serde::Serialize;

/// Cumulative counters for one run. Only moves forward, and only once a batch
/// has been fully handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub current_batch: usize,
    pub total_batches: usize,
}

impl RunStats {
    pub fn percentage_complete(&self) -> f64 {
        percentage(self.processed, self.total)
    }

    pub fn success_rate(&self) -> f64 {
        percentage(self.succeeded, self.processed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    stats: RunStats,
}

impl ProgressTracker {
    pub fn new(total: usize, batch_size: usize) -> Self {
        Self {
            stats: RunStats {
                total,
                total_batches: batch_count(total, batch_size),
                ..RunStats::default()
            },
        }
    }

    /// Adds one finished batch. `succeeded` is clamped to `processed`.
    pub fn record_batch(&mut self, processed: usize, succeeded: usize) {
        let succeeded = succeeded.min(processed);
        self.stats.processed += processed;
        self.stats.succeeded += succeeded;
        self.stats.failed = self.stats.processed - self.stats.succeeded;
        self.stats.current_batch = (self.stats.current_batch + 1).min(self.stats.total_batches);
    }

    pub fn percentage_complete(&self) -> f64 {
        self.stats.percentage_complete()
    }

    pub fn success_rate(&self) -> f64 {
        self.stats.success_rate()
    }

    pub fn stats(&self) -> RunStats {
        self.stats
    }
}

pub fn batch_count(total: usize, batch_size: usize) -> usize {
    let batch_size = batch_size.max(1);
    (total + batch_size - 1) / batch_size
}

fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 / whole as f64 * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_run_reports_zero() {
        let tracker = ProgressTracker::new(0, 10);
        assert_eq!(tracker.percentage_complete(), 0.0);
        assert_eq!(tracker.success_rate(), 0.0);
        assert_eq!(tracker.stats().total_batches, 0);
    }

    #[test]
    fn accumulates_batches() {
        let mut tracker = ProgressTracker::new(3, 2);
        assert_eq!(tracker.stats().total_batches, 2);

        tracker.record_batch(2, 1);
        assert_eq!(tracker.stats().current_batch, 1);
        assert!((tracker.percentage_complete() - 66.666).abs() < 0.01);

        tracker.record_batch(1, 1);
        let stats = tracker.stats();
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.current_batch, 2);
        assert_eq!(tracker.percentage_complete(), 100.0);
        assert!((tracker.success_rate() - 66.666).abs() < 0.01);
    }

    #[test]
    fn clamps_inconsistent_counts() {
        let mut tracker = ProgressTracker::new(5, 5);
        tracker.record_batch(2, 7);
        assert_eq!(tracker.stats().succeeded, 2);
        assert_eq!(tracker.stats().failed, 0);
    }

    #[test]
    fn counts_batches() {
        assert_eq!(batch_count(1000, 1000), 1);
        assert_eq!(batch_count(1001, 1000), 2);
        assert_eq!(batch_count(5, 0), 5);
    }
}
