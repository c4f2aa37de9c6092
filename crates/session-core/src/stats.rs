use crate::matrix::OperationId;
use serde::{Deserialize, Serialize};

/// Width of one latency histogram bucket.
pub const LATENCY_BUCKET_MS: u64 = 10;
const LATENCY_BUCKETS: usize = 1000; // up to 10 seconds

/// Outcome counts for a single operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStats {
    /// Completed invocations, failed ones included.
    pub count: u64,
    pub failures: u64,
    pub total_latency_ms: u64,
    pub max_latency_ms: u64,
}

impl OperationStats {
    fn merge(&mut self, other: &OperationStats) {
        self.count += other.count;
        self.failures += other.failures;
        self.total_latency_ms += other.total_latency_ms;
        self.max_latency_ms = self.max_latency_ms.max(other.max_latency_ms);
    }
}

/// Per-operation counters plus a latency histogram.
///
/// Plain data: a counter is owned by one session worker at a time and folded
/// into wave, phase and run totals with [`StatsCounter::merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsCounter {
    operations: Vec<OperationStats>,
    latency_buckets: Vec<u64>,
}

impl StatsCounter {
    pub fn new() -> Self {
        Self::with_operations(0)
    }

    pub fn with_operations(count: usize) -> Self {
        Self {
            operations: vec![OperationStats::default(); count],
            latency_buckets: vec![0; LATENCY_BUCKETS],
        }
    }

    fn slot(&mut self, operation: OperationId) -> &mut OperationStats {
        if operation >= self.operations.len() {
            self.operations
                .resize(operation + 1, OperationStats::default());
        }
        &mut self.operations[operation]
    }

    pub fn increment(&mut self, operation: OperationId) {
        self.slot(operation).count += 1;
    }

    /// Record one completed invocation with its latency.
    pub fn record(&mut self, operation: OperationId, latency_ms: u64, failed: bool) {
        let slot = self.slot(operation);
        slot.count += 1;
        if failed {
            slot.failures += 1;
        }
        slot.total_latency_ms += latency_ms;
        slot.max_latency_ms = slot.max_latency_ms.max(latency_ms);

        let bucket_idx = (latency_ms / LATENCY_BUCKET_MS).min((LATENCY_BUCKETS - 1) as u64) as usize;
        self.latency_buckets[bucket_idx] += 1;
    }

    /// Element-wise sum of `other` into `self`.
    pub fn merge(&mut self, other: &StatsCounter) {
        if other.operations.len() > self.operations.len() {
            self.operations
                .resize(other.operations.len(), OperationStats::default());
        }
        for (mine, theirs) in self.operations.iter_mut().zip(&other.operations) {
            mine.merge(theirs);
        }
        for (mine, theirs) in self.latency_buckets.iter_mut().zip(&other.latency_buckets) {
            *mine += theirs;
        }
    }

    /// Zero every count in place, keeping the operation slots.
    pub fn reset(&mut self) {
        self.operations.fill(OperationStats::default());
        self.latency_buckets.fill(0);
    }

    pub fn count(&self, operation: OperationId) -> u64 {
        self.get(operation).count
    }

    pub fn failures(&self, operation: OperationId) -> u64 {
        self.get(operation).failures
    }

    pub fn get(&self, operation: OperationId) -> OperationStats {
        self.operations.get(operation).copied().unwrap_or_default()
    }

    pub fn total(&self) -> u64 {
        self.operations.iter().map(|o| o.count).sum()
    }

    pub fn total_failures(&self) -> u64 {
        self.operations.iter().map(|o| o.failures).sum()
    }

    /// Read-only copy of the per-operation counts.
    pub fn snapshot(&self) -> Vec<OperationStats> {
        self.operations.clone()
    }

    /// Latency percentile in ms, bucket resolution.
    pub fn percentile(&self, p: u64) -> u64 {
        let total: u64 = self.latency_buckets.iter().sum();
        if total == 0 {
            return 0;
        }

        let target = ((total * p) / 100).max(1);
        let mut cumulative = 0u64;

        for (bucket_idx, &count) in self.latency_buckets.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return bucket_idx as u64 * LATENCY_BUCKET_MS;
            }
        }

        LATENCY_BUCKETS as u64 * LATENCY_BUCKET_MS
    }

    /// Named view for reports. `names` maps operation ids to labels.
    pub fn summary(&self, names: &[String]) -> StatsSummary {
        let operations = self
            .operations
            .iter()
            .enumerate()
            .map(|(id, stats)| OperationSummary {
                operation: names
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| format!("#{id}")),
                count: stats.count,
                failures: stats.failures,
                avg_latency_ms: if stats.count > 0 {
                    stats.total_latency_ms / stats.count
                } else {
                    0
                },
                max_latency_ms: stats.max_latency_ms,
            })
            .collect();

        StatsSummary {
            total: self.total(),
            failures: self.total_failures(),
            latency_p50_ms: self.percentile(50),
            latency_p95_ms: self.percentile(95),
            latency_p99_ms: self.percentile(99),
            operations,
        }
    }
}

impl Default for StatsCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationSummary {
    pub operation: String,
    pub count: u64,
    pub failures: u64,
    pub avg_latency_ms: u64,
    pub max_latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSummary {
    pub total: u64,
    pub failures: u64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    pub latency_p99_ms: u64,
    pub operations: Vec<OperationSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter(records: &[(OperationId, u64, bool)]) -> StatsCounter {
        let mut stats = StatsCounter::with_operations(3);
        for &(op, latency, failed) in records {
            stats.record(op, latency, failed);
        }
        stats
    }

    fn merged(a: &StatsCounter, b: &StatsCounter) -> StatsCounter {
        let mut out = a.clone();
        out.merge(b);
        out
    }

    #[test]
    fn test_increment_and_record() {
        let mut stats = StatsCounter::with_operations(2);
        stats.increment(0);
        stats.increment(0);
        stats.record(1, 40, true);
        stats.record(4, 5, false);

        assert_eq!(stats.count(0), 2);
        assert_eq!(stats.count(1), 1);
        assert_eq!(stats.failures(1), 1);
        assert_eq!(stats.count(4), 1);
        assert_eq!(stats.count(9), 0);
        assert_eq!(stats.total(), 4);
        assert_eq!(stats.total_failures(), 1);
        assert_eq!(stats.get(1).max_latency_ms, 40);
    }

    #[test]
    fn test_merge_is_commutative() {
        let a = counter(&[(0, 10, false), (1, 20, true)]);
        let b = counter(&[(1, 300, false), (2, 5, false), (2, 7, true)]);

        assert_eq!(merged(&a, &b), merged(&b, &a));
        assert_eq!(merged(&a, &b).count(1), 2);
    }

    #[test]
    fn test_merge_is_associative() {
        let a = counter(&[(0, 10, false)]);
        let b = counter(&[(1, 20, true), (0, 90, false)]);
        let mut c = StatsCounter::new();
        c.record(5, 1200, false);

        let left = merged(&merged(&a, &b), &c);
        let right = merged(&a, &merged(&b, &c));
        assert_eq!(left, right);
        assert_eq!(left.total(), 4);
    }

    #[test]
    fn test_reset_zeroes_snapshot() {
        let mut stats = counter(&[(0, 10, false), (2, 70, true)]);
        stats.reset();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.iter().all(|s| *s == OperationStats::default()));
        assert_eq!(stats.percentile(99), 0);
    }

    #[test]
    fn test_percentile_calculation() {
        let mut stats = StatsCounter::new();

        for _ in 0..50 {
            stats.record(0, 10, false);
        }
        for _ in 0..30 {
            stats.record(0, 20, false);
        }
        for _ in 0..20 {
            stats.record(0, 50, false);
        }

        assert_eq!(stats.percentile(50), 10);
        assert_eq!(stats.percentile(80), 20);
        assert_eq!(stats.percentile(95), 50);
    }

    #[test]
    fn test_summary_uses_names() {
        let stats = counter(&[(0, 10, false), (0, 30, false), (2, 70, true)]);
        let names = vec!["home".to_string(), "browse".to_string()];
        let summary = stats.summary(&names);

        assert_eq!(summary.total, 3);
        assert_eq!(summary.failures, 1);
        assert_eq!(summary.operations[0].operation, "home");
        assert_eq!(summary.operations[0].avg_latency_ms, 20);
        assert_eq!(summary.operations[2].operation, "#2");
    }
}
