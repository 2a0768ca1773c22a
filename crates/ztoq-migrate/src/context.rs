//! Per-run cache and performance counters.

use tracing::info;

use crate::cache::{CacheStats, CacheStore};
use crate::config::MigrationConfig;
use crate::core::EntityType;
use crate::monitor::{PerformanceMonitor, PerformanceReport};

/// Values shared between workers through the run cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// `/`-joined folder path including the folder's own name.
    FolderPath(String),
    /// Destination id assigned by the load phase.
    DestinationId(i64),
}

/// Cache and monitor owned by one run.
///
/// Built when a run starts or resumes and dropped when it stops, so
/// nothing leaks between runs.
#[derive(Debug)]
pub struct RunContext {
    pub cache: CacheStore<Lookup>,
    pub monitor: PerformanceMonitor,
}

impl RunContext {
    pub fn new(config: &MigrationConfig) -> Self {
        Self {
            cache: CacheStore::new(config.cache),
            monitor: PerformanceMonitor::new(config.slow_operation_limit),
        }
    }

    pub fn folder_path_key(folder_id: i64) -> String {
        format!("folder_path:{}", folder_id)
    }

    pub fn destination_key(entity_type: EntityType, source_id: i64) -> String {
        format!("dest:{}:{}", entity_type, source_id)
    }

    /// Final report, logged with cache statistics.
    pub fn finish(&self, run_id: &str) -> PerformanceReport {
        let report = self.monitor.report();
        let cache: CacheStats = self.cache.stats();
        info!(
            "Run {}: {} operations, avg {:.2}ms, error rate {:.1}%, cache hit rate {:.1}% ({} entries)",
            run_id,
            report.summary.total_operations,
            report.summary.avg_operation_time_ms,
            report.summary.error_rate * 100.0,
            cache.hit_rate() * 100.0,
            cache.entries
        );
        for op in &report.slow_operations {
            info!(
                "  slow: {} x{} avg {:.2}ms max {:.2}ms errors {:.1}%",
                op.operation,
                op.count,
                op.avg_time_ms,
                op.max_time_ms,
                op.error_rate * 100.0
            );
        }
        report
    }
}
