//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use sysinfo::System;
use tracing::info;

use crate::core::EntityType;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_gb = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,

    /// Where run state and staged records are kept.
    #[serde(default)]
    pub state: StateConfig,

    /// Offline source (JSON export directory).
    #[serde(default)]
    pub source: SourceConfig,

    /// Offline destination (JSON-lines output directory).
    #[serde(default)]
    pub target: TargetConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }
}

/// Source export configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Directory holding `<project_key>/<entity_type>.json` exports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_dir: Option<PathBuf>,
}

/// Destination output configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Directory receiving `<project_key>/<entity_type>.jsonl` files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
}

/// State persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Backend kind (default: file).
    #[serde(default)]
    pub backend: StateBackendKind,

    /// Directory for run documents and staged records (default: ".ztoq").
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackendKind::default(),
            dir: default_state_dir(),
        }
    }
}

/// Backend used to persist runs and staged records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendKind {
    /// JSON documents on disk; survives restarts.
    #[default]
    File,
    /// Process memory; nothing survives the process.
    Memory,
}

/// Cache tuning preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePreset {
    /// Long TTL: referenced data rarely changes during the run.
    #[default]
    ReadOptimized,
    /// Short TTL: the run itself is creating the referenced records.
    WriteOptimized,
    /// Explicit TTL in seconds.
    Custom { ttl_secs: u64 },
}

impl CachePreset {
    /// Default TTL applied to entries inserted under this preset.
    pub fn ttl(&self) -> Duration {
        match self {
            CachePreset::ReadOptimized => Duration::from_secs(3600),
            CachePreset::WriteOptimized => Duration::from_secs(30),
            CachePreset::Custom { ttl_secs } => Duration::from_secs(*ttl_secs),
        }
    }
}

/// Retry behavior for transient failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per batch, including the first (default: 5).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubles on each attempt (default: 500ms).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound for a single backoff delay (default: 30s).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Migration behavior configuration.
///
/// Handed to the engine once at run start and never mutated afterwards.
/// `max_workers` uses Option<T> to distinguish "not set" (auto-tuned)
/// from "explicitly set".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Records per page/batch (default: 50).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Concurrent batch workers per entity type. Auto-tuned from CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,

    /// Entity types to migrate; dependencies are added automatically. Empty = all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entity_types: Vec<EntityType>,

    /// Cache TTL preset (default: read_optimized).
    #[serde(default)]
    pub cache: CachePreset,

    /// Retry policy for transient failures.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Directory holding attachment binaries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments_dir: Option<PathBuf>,

    /// Operation groups listed in the slow-operation report (default: 5).
    #[serde(default = "default_slow_operation_limit")]
    pub slow_operation_limit: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_workers: None,
            entity_types: Vec::new(),
            cache: CachePreset::default(),
            retry: RetryConfig::default(),
            attachments_dir: None,
            slow_operation_limit: default_slow_operation_limit(),
        }
    }
}

impl MigrationConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        // Work is network-bound, so allow more workers than cores, capped
        // to keep pressure on the destination API reasonable.
        if self.max_workers.is_none() {
            let workers = (resources.cpu_cores * 2).clamp(2, 16);
            self.max_workers = Some(workers);
        }

        info!(
            "Auto-tuned config: max_workers={}, batch_size={}",
            self.get_max_workers(),
            self.batch_size
        );

        self
    }

    pub fn get_max_workers(&self) -> usize {
        self.max_workers.unwrap_or(4)
    }

    /// Entity types to process, closed over dependencies, in dependency order.
    pub fn entity_order(&self) -> Vec<EntityType> {
        EntityType::resolve_order(&self.entity_types)
    }
}

// Default value functions for serde
fn default_state_dir() -> PathBuf {
    PathBuf::from(".ztoq")
}

fn default_batch_size() -> usize {
    50
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_slow_operation_limit() -> usize {
    5
}
