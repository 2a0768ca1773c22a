//! Bounded-concurrency batch processing for one phase of a run.
//!
//! Entity types run strictly one after another in dependency order. Within
//! one entity type a single dispatcher pages through the input with the
//! keyset cursor and hands each page to a worker task, at most
//! `max_workers` at a time. Workers commit their batch and advance the
//! checkpoint through a [`CommitTracker`], so the checkpoint only moves
//! over a contiguous prefix of finished batches.

mod retry;
mod tracker;
mod worker;

pub use retry::RetryPolicy;
pub use tracker::CommitTracker;
pub use worker::BatchSummary;

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::checkpoint::CheckpointStore;
use crate::context::RunContext;
use crate::core::{Cursor, EntityType, Fetcher, Loader, PaginationCursor};
use crate::error::{MigrateError, Result};
use crate::rules::Transformer;
use crate::staging::{Stage, StagedSource, StagingStore};
use crate::state::{BatchRecord, BatchStatus, Phase};
use worker::PhaseWorker;

/// How a phase (or one entity type within it) ended.
#[derive(Debug)]
pub enum PhaseOutcome {
    /// Every entity type reached the end of its input.
    Completed,
    /// Stopped on request after in-flight batches committed.
    Paused,
    /// Stopped by an error; the checkpoint stays behind the failed batch.
    Failed {
        entity_type: EntityType,
        error: MigrateError,
    },
}

/// Per-entity totals for one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityOutcome {
    pub entity_type: EntityType,
    pub batches_committed: u64,
    pub batches_rejected: u64,
    pub records_committed: u64,
    pub records_failed: u64,
    /// Already complete before this call; nothing was fetched.
    pub skipped: bool,
    pub complete: bool,
}

impl EntityOutcome {
    fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            batches_committed: 0,
            batches_rejected: 0,
            records_committed: 0,
            records_failed: 0,
            skipped: false,
            complete: false,
        }
    }
}

/// Result of [`BatchScheduler::run_phase`].
#[derive(Debug)]
pub struct PhaseResult {
    pub phase: Phase,
    pub outcome: PhaseOutcome,
    pub entities: Vec<EntityOutcome>,
}

impl PhaseResult {
    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, PhaseOutcome::Completed)
    }

    pub fn records_committed(&self) -> u64 {
        self.entities.iter().map(|e| e.records_committed).sum()
    }

    pub fn records_failed(&self) -> u64 {
        self.entities.iter().map(|e| e.records_failed).sum()
    }
}

/// Runs phases of one run against its collaborators.
pub struct BatchScheduler {
    source: Arc<dyn Fetcher>,
    loader: Arc<dyn Loader>,
    store: Arc<CheckpointStore>,
    staging: Arc<dyn StagingStore>,
    context: Arc<RunContext>,
    retry: RetryPolicy,
    attachments_dir: Option<PathBuf>,
    cancel: CancellationToken,
}

impl BatchScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn Fetcher>,
        loader: Arc<dyn Loader>,
        store: Arc<CheckpointStore>,
        staging: Arc<dyn StagingStore>,
        context: Arc<RunContext>,
        retry: RetryPolicy,
        attachments_dir: Option<PathBuf>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            loader,
            store,
            staging,
            context,
            retry,
            attachments_dir,
            cancel,
        }
    }

    /// Process every entity type of `phase`, in the given dependency order.
    pub async fn run_phase(
        &self,
        run_id: &str,
        phase: Phase,
        entity_types: &[EntityType],
        batch_size: usize,
        max_workers: usize,
    ) -> Result<PhaseResult> {
        if !phase.is_work() {
            return Err(MigrateError::InvalidTransition {
                run_id: run_id.to_string(),
                message: format!("{} is not a work phase", phase),
            });
        }
        let project_key = self.store.run(run_id).await?.project_key;
        let span = info_span!("phase", run_id = %run_id, phase = %phase);

        async {
            info!(
                "Starting {} for {} entity types ({} workers, batch size {})",
                phase,
                entity_types.len(),
                max_workers,
                batch_size
            );

            let mut entities = Vec::with_capacity(entity_types.len());
            for entity_type in entity_types {
                let (outcome, entity) = self
                    .run_entity(
                        run_id,
                        &project_key,
                        phase,
                        *entity_type,
                        entity_types,
                        batch_size,
                        max_workers.max(1),
                    )
                    .await?;
                entities.push(entity);

                match outcome {
                    PhaseOutcome::Completed => {}
                    stopped => {
                        return Ok(PhaseResult {
                            phase,
                            outcome: stopped,
                            entities,
                        })
                    }
                }
            }

            info!("{} complete", phase);
            Ok(PhaseResult {
                phase,
                outcome: PhaseOutcome::Completed,
                entities,
            })
        }
        .instrument(span)
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_entity(
        &self,
        run_id: &str,
        project_key: &str,
        phase: Phase,
        entity_type: EntityType,
        selected: &[EntityType],
        batch_size: usize,
        max_workers: usize,
    ) -> Result<(PhaseOutcome, EntityOutcome)> {
        let mut outcome = EntityOutcome::new(entity_type);

        let start = self.store.read(run_id, phase, entity_type).await?;
        if start.is_end() {
            info!("{}: already complete, skipping", entity_type);
            outcome.skipped = true;
            outcome.complete = true;
            return Ok((PhaseOutcome::Completed, outcome));
        }

        for dependency in entity_type.dependencies() {
            if !selected.contains(dependency) {
                continue;
            }
            let cursor = self.store.read(run_id, phase, *dependency).await?;
            if !cursor.is_end() {
                let error = MigrateError::DependencyIncomplete {
                    entity_type,
                    dependency: *dependency,
                };
                return Ok((PhaseOutcome::Failed { entity_type, error }, outcome));
            }
        }

        let input: Arc<dyn Fetcher> = match Stage::input_of(phase) {
            Some(stage) => Arc::new(StagedSource::new(self.staging.clone(), run_id, stage)),
            None => self.source.clone(),
        };
        match input.estimate_total(project_key, entity_type).await {
            Ok(Some(total)) => {
                self.store
                    .set_estimate(run_id, phase, entity_type, Some(total))
                    .await?
            }
            Ok(None) => {}
            Err(e) => warn!("{}: size estimate unavailable: {}", entity_type, e),
        }
        let pages = PaginationCursor::new(input, project_key);

        info!("{}: starting at {}", entity_type, start);

        let worker = Arc::new(PhaseWorker {
            run_id: run_id.to_string(),
            project_key: project_key.to_string(),
            phase,
            entity_type,
            store: self.store.clone(),
            staging: self.staging.clone(),
            loader: self.loader.clone(),
            context: self.context.clone(),
            transformer: Arc::new(Transformer::new(
                run_id,
                self.staging.clone(),
                self.attachments_dir.clone(),
            )),
            retry: self.retry.clone(),
            tracker: Mutex::new(CommitTracker::new(start)),
        });

        let semaphore = Arc::new(Semaphore::new(max_workers));
        let mut workers: JoinSet<Result<BatchSummary>> = JoinSet::new();
        let mut failure: Option<MigrateError> = None;
        let mut paused = false;
        let mut exhausted = false;
        let mut cursor = start;
        let mut sequence = 0u64;
        let fetch_op = format!("fetch:{}", entity_type);

        loop {
            while let Some(joined) = workers.try_join_next() {
                absorb(joined, &mut outcome, &mut failure);
            }
            if failure.is_some() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    paused = true;
                    break;
                }
                permit = semaphore.clone().acquire_owned() => permit
                    .map_err(|_| MigrateError::State("worker pool closed".into()))?,
            };

            // A worker may have failed while we waited for its permit.
            while let Some(joined) = workers.try_join_next() {
                absorb(joined, &mut outcome, &mut failure);
            }
            if failure.is_some() {
                break;
            }

            let (page, _) = self
                .retry
                .run(&format!("{} after {}", fetch_op, cursor), |_| {
                    self.context
                        .monitor
                        .time(&fetch_op, pages.next(entity_type, cursor, batch_size))
                })
                .await;
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };

            if page.records.is_empty() {
                exhausted = true;
                break;
            }

            let batch = BatchRecord {
                run_id: run_id.to_string(),
                phase,
                entity_type,
                sequence,
                cursor,
                end_cursor: page.next_cursor,
                size: page.records.len(),
                first_id: page.first_id(),
                last_id: page.last_id(),
                status: BatchStatus::Pending,
                attempt_count: 0,
                records_ok: 0,
                records_failed: 0,
                last_error: None,
                updated_at: Utc::now(),
            };
            let batch = self
                .store
                .update(run_id, move |state| state.open_batch(batch))
                .await?;

            let worker = worker.clone();
            let records = page.records;
            workers.spawn(async move {
                let result = worker.process(batch, records).await;
                drop(permit);
                result
            });

            cursor = page.next_cursor;
            sequence += 1;
            if page.done {
                exhausted = true;
                break;
            }
        }

        // In-flight batches always finish and commit before we return.
        while let Some(joined) = workers.join_next().await {
            absorb(joined, &mut outcome, &mut failure);
        }

        if let Some(error) = failure {
            warn!("{}: failed: {}", entity_type, error);
            return Ok((PhaseOutcome::Failed { entity_type, error }, outcome));
        }
        if paused || !exhausted {
            info!(
                "{}: paused at {} ({} batches committed)",
                entity_type,
                self.store.read(run_id, phase, entity_type).await?,
                outcome.batches_committed
            );
            return Ok((PhaseOutcome::Paused, outcome));
        }

        // Covers an input that ends exactly on a page boundary.
        self.store
            .advance(run_id, phase, entity_type, Cursor::End)
            .await?;
        outcome.complete = true;
        info!(
            "{}: complete ({} committed, {} failed)",
            entity_type, outcome.records_committed, outcome.records_failed
        );
        Ok((PhaseOutcome::Completed, outcome))
    }
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("source", &self.source.name())
            .field("loader", &self.loader.name())
            .field("retry", &self.retry)
            .finish()
    }
}

fn absorb(
    joined: std::result::Result<Result<BatchSummary>, tokio::task::JoinError>,
    outcome: &mut EntityOutcome,
    failure: &mut Option<MigrateError>,
) {
    match joined {
        Ok(Ok(summary)) => {
            if summary.records_ok == 0 && summary.records_skipped == 0 && summary.records_failed > 0 {
                outcome.batches_rejected += 1;
            } else {
                outcome.batches_committed += 1;
            }
            outcome.records_committed += summary.records_ok as u64;
            outcome.records_failed += summary.records_failed as u64;
        }
        Ok(Err(e)) => {
            failure.get_or_insert(e);
        }
        Err(e) => {
            failure.get_or_insert(MigrateError::Join(e));
        }
    }
}
