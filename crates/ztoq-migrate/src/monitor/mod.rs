//! Per-operation latency and outcome tracking.
//!
//! Recording is O(1): each operation name owns one aggregate slot in a
//! sharded [`DashMap`], so concurrent workers only contend when they
//! record the same operation on the same shard. Reports are computed on
//! demand from the aggregates.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};

use crate::error::Result;

/// One timed operation outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub operation: String,
    pub duration: Duration,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// Running totals for one operation name.
#[derive(Debug, Clone, Default)]
struct OperationAggregate {
    count: u64,
    errors: u64,
    total: Duration,
    max: Duration,
    last_seen: Option<DateTime<Utc>>,
}

/// Aggregated statistics for one operation group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStats {
    pub operation: String,
    pub count: u64,
    pub avg_time_ms: f64,
    pub max_time_ms: f64,
    pub error_rate: f64,
}

/// Totals across every operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_operations: u64,
    pub avg_operation_time_ms: f64,
    pub error_rate: f64,
}

/// Report returned by [`PerformanceMonitor::report`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub summary: PerformanceSummary,
    /// Slowest operation groups, ordered by average time descending.
    pub slow_operations: Vec<OperationStats>,
}

/// Collects per-operation timings for one run.
#[derive(Debug)]
pub struct PerformanceMonitor {
    operations: DashMap<String, OperationAggregate>,
    slow_limit: usize,
}

impl PerformanceMonitor {
    /// Create a monitor reporting at most `slow_limit` slow operation groups.
    pub fn new(slow_limit: usize) -> Self {
        Self {
            operations: DashMap::new(),
            slow_limit: slow_limit.max(1),
        }
    }

    /// Record one operation outcome.
    pub fn record(&self, operation: &str, duration: Duration, success: bool) {
        self.record_entry(PerformanceRecord {
            operation: operation.to_string(),
            duration,
            success,
            timestamp: Utc::now(),
        });
    }

    /// Fold a full record into its operation's aggregate.
    pub fn record_entry(&self, record: PerformanceRecord) {
        let mut agg = self.operations.entry(record.operation).or_default();
        agg.count += 1;
        if !record.success {
            agg.errors += 1;
        }
        agg.total += record.duration;
        if record.duration > agg.max {
            agg.max = record.duration;
        }
        agg.last_seen = Some(record.timestamp);
    }

    /// Time an async operation and record its outcome.
    pub async fn time<T, Fut>(&self, operation: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let result = fut.await;
        self.record(operation, start.elapsed(), result.is_ok());
        result
    }

    /// Per-operation statistics, unordered.
    pub fn operation_stats(&self) -> Vec<OperationStats> {
        self.operations
            .iter()
            .map(|entry| {
                let agg = entry.value();
                let count = agg.count.max(1) as f64;
                OperationStats {
                    operation: entry.key().clone(),
                    count: agg.count,
                    avg_time_ms: agg.total.as_secs_f64() * 1000.0 / count,
                    max_time_ms: agg.max.as_secs_f64() * 1000.0,
                    error_rate: agg.errors as f64 / count,
                }
            })
            .collect()
    }

    /// Summary plus the slowest operation groups.
    pub fn report(&self) -> PerformanceReport {
        let mut total_operations = 0u64;
        let mut total_errors = 0u64;
        let mut total_time = Duration::ZERO;
        for entry in self.operations.iter() {
            total_operations += entry.count;
            total_errors += entry.errors;
            total_time += entry.total;
        }

        let summary = if total_operations == 0 {
            PerformanceSummary::default()
        } else {
            PerformanceSummary {
                total_operations,
                avg_operation_time_ms: total_time.as_secs_f64() * 1000.0
                    / total_operations as f64,
                error_rate: total_errors as f64 / total_operations as f64,
            }
        };

        let mut slow_operations = self.operation_stats();
        slow_operations.sort_by(|a, b| {
            b.avg_time_ms
                .total_cmp(&a.avg_time_ms)
                .then_with(|| a.operation.cmp(&b.operation))
        });
        slow_operations.truncate(self.slow_limit);

        PerformanceReport {
            summary,
            slow_operations,
        }
    }

    /// Drop all aggregates.
    pub fn reset(&self) {
        self.operations.clear();
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(5)
    }
}
