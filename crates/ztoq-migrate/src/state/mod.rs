//! Persisted run state: runs, batches, checkpoints, progress and failures.
//!
//! One [`RunState`] document exists per run. It is written through a
//! [`StateBackend`] after every mutation and signed with HMAC-SHA256 so a
//! tampered or truncated document is rejected on load.

mod backend;
mod file;
mod memory;

pub use backend::StateBackend;
pub use file::FileStateBackend;
pub use memory::MemoryStateBackend;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::config::MigrationConfig;
use crate::core::{Cursor, EntityType};
use crate::error::{ErrorKind, MigrateError, Result};
use crate::monitor::PerformanceReport;

type HmacSha256 = Hmac<Sha256>;

/// Workflow phase. `Done` and `Failed` are terminal markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Extract,
    Transform,
    Validate,
    Load,
    Done,
    Failed,
}

impl Phase {
    /// Phases that perform work, in execution order.
    pub const WORK: [Phase; 4] = [Phase::Extract, Phase::Transform, Phase::Validate, Phase::Load];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Extract => "extract",
            Phase::Transform => "transform",
            Phase::Validate => "validate",
            Phase::Load => "load",
            Phase::Done => "done",
            Phase::Failed => "failed",
        }
    }

    /// The phase entered after this one completes.
    pub fn next(&self) -> Option<Phase> {
        match self {
            Phase::Extract => Some(Phase::Transform),
            Phase::Transform => Some(Phase::Validate),
            Phase::Validate => Some(Phase::Load),
            Phase::Load => Some(Phase::Done),
            Phase::Done | Phase::Failed => None,
        }
    }

    pub fn is_work(&self) -> bool {
        Self::WORK.contains(self)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "extract" => Ok(Phase::Extract),
            "transform" => Ok(Phase::Transform),
            "validate" => Ok(Phase::Validate),
            "load" => Ok(Phase::Load),
            "done" => Ok(Phase::Done),
            "failed" => Ok(Phase::Failed),
            _ => Err(MigrateError::Config(format!("Invalid phase: {}", s))),
        }
    }
}

/// Overall run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One migration attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRun {
    pub run_id: String,
    pub project_key: String,
    pub phase: Phase,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Work phase that was active when the run failed (resume point).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<Phase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl MigrationRun {
    pub fn new(run_id: String, project_key: String) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            project_key,
            phase: Phase::Extract,
            status: RunStatus::Running,
            created_at: now,
            updated_at: now,
            failed_phase: None,
            completed_at: None,
        }
    }

    /// The work phase a resumed run continues with.
    pub fn resume_phase(&self) -> Phase {
        match self.phase {
            Phase::Failed => self.failed_phase.unwrap_or(Phase::Extract),
            other => other,
        }
    }

    /// Move to the phase following `completed`.
    ///
    /// Phases are sequential: only the current phase may be completed.
    pub fn complete_phase(&mut self, completed: Phase) -> Result<Phase> {
        if self.phase != completed {
            return Err(MigrateError::InvalidTransition {
                run_id: self.run_id.clone(),
                message: format!(
                    "cannot complete {} while the run is in {}",
                    completed, self.phase
                ),
            });
        }
        let next = completed.next().ok_or_else(|| MigrateError::InvalidTransition {
            run_id: self.run_id.clone(),
            message: format!("{} has no successor", completed),
        })?;
        self.phase = next;
        self.touch();
        if next == Phase::Done {
            self.status = RunStatus::Completed;
            self.completed_at = Some(self.updated_at);
        }
        Ok(next)
    }

    /// Reopen a paused or failed run.
    pub fn mark_running(&mut self) -> Result<()> {
        match self.status {
            RunStatus::Completed => Err(MigrateError::InvalidTransition {
                run_id: self.run_id.clone(),
                message: "run already completed".into(),
            }),
            _ => {
                self.phase = self.resume_phase();
                self.failed_phase = None;
                self.status = RunStatus::Running;
                self.touch();
                Ok(())
            }
        }
    }

    pub fn mark_paused(&mut self) {
        if self.status == RunStatus::Running {
            self.status = RunStatus::Paused;
            self.touch();
        }
    }

    pub fn mark_failed(&mut self) {
        if self.phase.is_work() {
            self.failed_phase = Some(self.phase);
        }
        self.phase = Phase::Failed;
        self.status = RunStatus::Failed;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Batch processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    InProgress,
    Committed,
    Failed,
}

/// One page of records for one entity type within one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub run_id: String,
    pub phase: Phase,
    pub entity_type: EntityType,
    /// Dispatch order within (phase, entity type) for the current drive.
    pub sequence: u64,
    /// Position the page was fetched after. Identifies the batch across
    /// resumes.
    pub cursor: Cursor,
    /// Position after the page's last record.
    pub end_cursor: Cursor,
    pub size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_id: Option<i64>,
    pub status: BatchStatus,
    pub attempt_count: u32,
    #[serde(default)]
    pub records_ok: usize,
    #[serde(default)]
    pub records_failed: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Last committed position for (run, phase, entity type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    pub phase: Phase,
    pub entity_type: EntityType,
    pub last_committed_cursor: Cursor,
    pub updated_at: DateTime<Utc>,
}

/// A record (or batch, when `record_id` is None) that did not make it through.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub phase: Phase,
    pub entity_type: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<i64>,
    pub cause: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Progress counters for (phase, entity type).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityProgress {
    pub pages_committed: u64,
    pub records_committed: u64,
    pub records_failed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_total: Option<u64>,
}

/// Structured cause of the last run failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<EntityType>,
    pub at: DateTime<Utc>,
}

/// Per-entity view inside a [`RunSnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityStatus {
    pub phase: Phase,
    pub entity_type: EntityType,
    pub checkpoint: Cursor,
    pub complete: bool,
    #[serde(flatten)]
    pub progress: EntityProgress,
}

/// Read-only view of a run returned by `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: MigrationRun,
    pub entities: Vec<EntityStatus>,
    pub records_committed: u64,
    pub records_failed: u64,
    pub failures: Vec<FailureRecord>,
    pub failed_batches: Vec<BatchRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RunError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceReport>,
}

impl RunSnapshot {
    /// Failures with the given cause.
    pub fn failures_with_cause(&self, cause: ErrorKind) -> Vec<&FailureRecord> {
        self.failures.iter().filter(|f| f.cause == cause).collect()
    }
}

/// Persisted document for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run: MigrationRun,

    /// Configuration the run was started with.
    pub config: MigrationConfig,

    /// SHA256 hash of `config`; also the HMAC key.
    pub config_hash: String,

    /// Keyed by `phase/entity_type`.
    #[serde(default)]
    pub checkpoints: BTreeMap<String, Checkpoint>,

    /// Keyed by `phase/entity_type/cursor`.
    #[serde(default)]
    pub batches: BTreeMap<String, BatchRecord>,

    /// Keyed by `phase/entity_type`.
    #[serde(default)]
    pub progress: BTreeMap<String, EntityProgress>,

    #[serde(default)]
    pub failures: Vec<FailureRecord>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RunError>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceReport>,

    /// HMAC-SHA256 signature computed over the document without this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,

    /// Record-level ledger keys, built from `failures` on first use.
    #[serde(skip)]
    failure_index: Option<HashSet<(Phase, EntityType, i64)>>,
}

pub(crate) fn entity_key(phase: Phase, entity_type: EntityType) -> String {
    format!("{}/{}", phase, entity_type)
}

fn batch_key(phase: Phase, entity_type: EntityType, cursor: Cursor) -> String {
    let position = match cursor {
        Cursor::Start => "0".to_string(),
        Cursor::After(id) => format!("1-{:020}", id),
        Cursor::End => "2".to_string(),
    };
    format!("{}/{}/{}", phase, entity_type, position)
}

impl RunState {
    /// Create a new run document.
    pub fn new(run_id: String, project_key: String, config: MigrationConfig) -> Self {
        let config_hash = config.hash();
        Self {
            run: MigrationRun::new(run_id, project_key),
            config,
            config_hash,
            checkpoints: BTreeMap::new(),
            batches: BTreeMap::new(),
            progress: BTreeMap::new(),
            failures: Vec::new(),
            last_error: None,
            performance: None,
            hmac: None,
            failure_index: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run.run_id
    }

    /// Compute HMAC-SHA256 over the document, keyed by the config hash.
    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)
            .map_err(|e| MigrateError::State(format!("Failed to serialize state for HMAC: {}", e)))?;

        let mut mac = HmacSha256::new_from_slice(self.config_hash.as_bytes())
            .map_err(|e| MigrateError::State(format!("Failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Attach a fresh signature.
    pub fn sign(&mut self) -> Result<()> {
        self.hmac = Some(self.compute_hmac()?);
        Ok(())
    }

    /// Check the signature and that the config hash still matches the config.
    ///
    /// Unsigned documents are accepted with a warning and signed on next save.
    pub fn verify(&self) -> Result<()> {
        match &self.hmac {
            Some(stored) => {
                if stored != &self.compute_hmac()? {
                    return Err(MigrateError::State(format!(
                        "Run {} failed integrity check: HMAC mismatch (possible tampering)",
                        self.run_id()
                    )));
                }
            }
            None => {
                tracing::warn!(
                    "Run {} has no HMAC signature, integrity cannot be verified",
                    self.run_id()
                );
            }
        }
        if self.config_hash != self.config.hash() {
            return Err(MigrateError::ConfigChanged);
        }
        Ok(())
    }

    /// Last committed cursor, or `Start` if none was written.
    pub fn checkpoint(&self, phase: Phase, entity_type: EntityType) -> Cursor {
        self.checkpoints
            .get(&entity_key(phase, entity_type))
            .map(|c| c.last_committed_cursor)
            .unwrap_or(Cursor::Start)
    }

    /// Advance a checkpoint. Non-increasing cursors are ignored.
    ///
    /// Returns whether the stored cursor changed.
    pub fn advance_checkpoint(
        &mut self,
        phase: Phase,
        entity_type: EntityType,
        cursor: Cursor,
    ) -> bool {
        if cursor <= self.checkpoint(phase, entity_type) {
            return false;
        }

        self.checkpoints.insert(
            entity_key(phase, entity_type),
            Checkpoint {
                run_id: self.run.run_id.clone(),
                phase,
                entity_type,
                last_committed_cursor: cursor,
                updated_at: Utc::now(),
            },
        );

        // Committed batches behind the checkpoint are fully captured by it
        // and the progress counters; failed ones stay for the report.
        let prefix = format!("{}/", entity_key(phase, entity_type));
        self.batches.retain(|key, batch| {
            !(key.starts_with(&prefix)
                && batch.status == BatchStatus::Committed
                && batch.end_cursor <= cursor)
        });

        true
    }

    /// Whether (phase, entity type) has been fully committed.
    pub fn is_complete(&self, phase: Phase, entity_type: EntityType) -> bool {
        self.checkpoint(phase, entity_type).is_end()
    }

    /// Drop every checkpoint.
    pub fn clear_checkpoints(&mut self) -> usize {
        let count = self.checkpoints.len();
        self.checkpoints.clear();
        count
    }

    /// Append to the failure ledger.
    ///
    /// A record failure already ledgered for the same (phase, entity type,
    /// record) is dropped, as a batch replayed after a crash reports it
    /// again. Returns whether the entry was added.
    pub fn push_failure(&mut self, failure: FailureRecord) -> bool {
        if let Some(record_id) = failure.record_id {
            let failures = &self.failures;
            let index = self.failure_index.get_or_insert_with(|| {
                failures
                    .iter()
                    .filter_map(|f| f.record_id.map(|id| (f.phase, f.entity_type, id)))
                    .collect()
            });
            if !index.insert((failure.phase, failure.entity_type, record_id)) {
                return false;
            }
        }
        self.failures.push(failure);
        true
    }

    /// Insert or replace a batch record.
    pub fn upsert_batch(&mut self, batch: BatchRecord) {
        self.batches.insert(
            batch_key(batch.phase, batch.entity_type, batch.cursor),
            batch,
        );
    }

    /// Register a batch about to be dispatched.
    ///
    /// A page fetched again from the same cursor (after a failure or a
    /// crash) continues the existing record: its attempt count carries
    /// over instead of restarting. Returns the stored record.
    pub fn open_batch(&mut self, mut batch: BatchRecord) -> BatchRecord {
        if let Some(existing) = self.batch(batch.phase, batch.entity_type, batch.cursor) {
            batch.attempt_count = existing.attempt_count;
        }
        self.upsert_batch(batch.clone());
        batch
    }

    pub fn batch(&self, phase: Phase, entity_type: EntityType, cursor: Cursor) -> Option<&BatchRecord> {
        self.batches.get(&batch_key(phase, entity_type, cursor))
    }

    pub fn progress(&self, phase: Phase, entity_type: EntityType) -> EntityProgress {
        self.progress
            .get(&entity_key(phase, entity_type))
            .cloned()
            .unwrap_or_default()
    }

    pub fn progress_mut(&mut self, phase: Phase, entity_type: EntityType) -> &mut EntityProgress {
        self.progress
            .entry(entity_key(phase, entity_type))
            .or_default()
    }

    /// Build the read-only status view.
    pub fn snapshot(&self) -> RunSnapshot {
        let entity_order = self.config.entity_order();
        let mut entities = Vec::new();
        for phase in Phase::WORK {
            for entity_type in &entity_order {
                let key = entity_key(phase, *entity_type);
                if !self.checkpoints.contains_key(&key) && !self.progress.contains_key(&key) {
                    continue;
                }
                let checkpoint = self.checkpoint(phase, *entity_type);
                entities.push(EntityStatus {
                    phase,
                    entity_type: *entity_type,
                    checkpoint,
                    complete: checkpoint.is_end(),
                    progress: self.progress(phase, *entity_type),
                });
            }
        }

        // Records that reached the destination are the load phase's commits.
        let records_committed = entity_order
            .iter()
            .map(|e| self.progress(Phase::Load, *e).records_committed)
            .sum();
        let records_failed = self
            .failures
            .iter()
            .filter(|f| f.record_id.is_some())
            .count() as u64;

        RunSnapshot {
            run: self.run.clone(),
            entities,
            records_committed,
            records_failed,
            failures: self.failures.clone(),
            failed_batches: self
                .batches
                .values()
                .filter(|b| b.status == BatchStatus::Failed)
                .cloned()
                .collect(),
            last_error: self.last_error.clone(),
            performance: self.performance.clone(),
        }
    }
}
