//! Durable checkpoints and run bookkeeping.
//!
//! [`CheckpointStore`] owns the in-memory copy of every open run document
//! and writes it through the configured [`StateBackend`] after each
//! mutation. Each run is guarded by its own async mutex; that mutex is the
//! serialization point for checkpoint advancement, so concurrent workers
//! of one run never interleave partial updates while other runs proceed
//! independently.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::core::{Cursor, EntityType};
use crate::error::{MigrateError, Result};
use crate::state::{
    BatchRecord, BatchStatus, FailureRecord, MigrationRun, Phase, RunSnapshot, RunState,
    StateBackend,
};

/// Per-run checkpoint, batch, progress and failure storage.
pub struct CheckpointStore {
    backend: Arc<dyn StateBackend>,
    runs: DashMap<String, Arc<Mutex<RunState>>>,
}

impl CheckpointStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            backend,
            runs: DashMap::new(),
        }
    }

    /// Prepare the backend.
    pub async fn init(&self) -> Result<()> {
        self.backend.init().await
    }

    pub fn backend_type(&self) -> &'static str {
        self.backend.backend_type()
    }

    /// Persist a freshly created run and keep it open.
    pub async fn create(&self, state: RunState) -> Result<()> {
        self.backend.save(&state).await?;
        info!(
            "Created run {} for project {} ({} backend)",
            state.run.run_id,
            state.run.project_key,
            self.backend.backend_type()
        );
        self.runs
            .insert(state.run.run_id.clone(), Arc::new(Mutex::new(state)));
        Ok(())
    }

    /// Open handle for a run, loading it from the backend on first use.
    async fn handle(&self, run_id: &str) -> Result<Arc<Mutex<RunState>>> {
        let cached = self.runs.get(run_id).map(|h| h.value().clone());
        if let Some(handle) = cached {
            return Ok(handle);
        }

        let state = self
            .backend
            .load(run_id)
            .await?
            .ok_or_else(|| MigrateError::RunNotFound(run_id.to_string()))?;

        // Another task may have opened the run meanwhile; keep the first copy.
        let handle = self
            .runs
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(state)))
            .clone();
        Ok(handle)
    }

    /// Apply a mutation under the run's lock and persist the result.
    pub async fn update<T, F>(&self, run_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut RunState) -> T + Send,
        T: Send,
    {
        let handle = self.handle(run_id).await?;
        let mut state = handle.lock().await;
        let out = f(&mut state);
        self.backend.save(&state).await?;
        Ok(out)
    }

    /// Clone of the current run document.
    pub async fn state(&self, run_id: &str) -> Result<RunState> {
        let handle = self.handle(run_id).await?;
        let state = handle.lock().await;
        Ok(state.clone())
    }

    pub async fn run(&self, run_id: &str) -> Result<MigrationRun> {
        let handle = self.handle(run_id).await?;
        let state = handle.lock().await;
        Ok(state.run.clone())
    }

    /// Last committed cursor, or `Start` when nothing was committed.
    pub async fn read(&self, run_id: &str, phase: Phase, entity_type: EntityType) -> Result<Cursor> {
        let handle = self.handle(run_id).await?;
        let state = handle.lock().await;
        Ok(state.checkpoint(phase, entity_type))
    }

    /// Advance a checkpoint.
    ///
    /// A cursor at or behind the stored one is ignored, not an error, so a
    /// duplicate commit from a retried worker is harmless. Returns whether
    /// the stored cursor changed; nothing is written when it did not.
    pub async fn advance(
        &self,
        run_id: &str,
        phase: Phase,
        entity_type: EntityType,
        cursor: Cursor,
    ) -> Result<bool> {
        let handle = self.handle(run_id).await?;
        let mut state = handle.lock().await;
        if !state.advance_checkpoint(phase, entity_type, cursor) {
            debug!(
                "Run {}: ignoring non-increasing {} checkpoint {} for {}",
                run_id, phase, cursor, entity_type
            );
            return Ok(false);
        }
        self.backend.save(&state).await?;
        debug!(
            "Run {}: {} checkpoint for {} advanced to {}",
            run_id, phase, entity_type, cursor
        );
        Ok(true)
    }

    /// Record a batch whose work finished or failed.
    ///
    /// Only committed batches count as committed pages. Failures (record
    /// or batch level) are appended to the run's ledger either way.
    pub async fn finish_batch(&self, batch: BatchRecord, failures: Vec<FailureRecord>) -> Result<()> {
        let run_id = batch.run_id.clone();
        self.update(&run_id, move |state| {
            let mut new_record_failures = 0u64;
            for failure in failures {
                let record_level = failure.record_id.is_some();
                if state.push_failure(failure) && record_level {
                    new_record_failures += 1;
                }
            }

            let progress = state.progress_mut(batch.phase, batch.entity_type);
            progress.records_failed += new_record_failures;
            if batch.status == BatchStatus::Committed {
                progress.pages_committed += 1;
                progress.records_committed += batch.records_ok as u64;
            }
            state.upsert_batch(batch);
        })
        .await
    }

    /// Record the source's size estimate for progress reporting.
    pub async fn set_estimate(
        &self,
        run_id: &str,
        phase: Phase,
        entity_type: EntityType,
        estimated_total: Option<u64>,
    ) -> Result<()> {
        self.update(run_id, |state| {
            state.progress_mut(phase, entity_type).estimated_total = estimated_total;
        })
        .await
    }

    /// Remove every checkpoint of a run. Returns how many were removed.
    pub async fn cleanup(&self, run_id: &str) -> Result<usize> {
        let removed = self.update(run_id, |state| state.clear_checkpoints()).await?;
        info!("Run {}: removed {} checkpoints", run_id, removed);
        Ok(removed)
    }

    /// Drop the run document entirely.
    pub async fn delete(&self, run_id: &str) -> Result<bool> {
        self.runs.remove(run_id);
        self.backend.delete(run_id).await
    }

    pub async fn snapshot(&self, run_id: &str) -> Result<RunSnapshot> {
        let handle = self.handle(run_id).await?;
        let state = handle.lock().await;
        Ok(state.snapshot())
    }

    /// Most recently created run for a project.
    pub async fn latest_run(&self, project_key: &str) -> Result<Option<MigrationRun>> {
        Ok(self
            .backend
            .load_latest(project_key)
            .await?
            .map(|state| state.run))
    }

    /// Forget the in-memory copy; the next access reloads from the backend.
    pub fn evict(&self, run_id: &str) {
        self.runs.remove(run_id);
    }
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("backend", &self.backend.backend_type())
            .field("open_runs", &self.runs.len())
            .finish()
    }
}
