//! Phase work for one batch.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::retry::RetryPolicy;
use super::tracker::CommitTracker;
use crate::checkpoint::CheckpointStore;
use crate::context::{Lookup, RunContext};
use crate::core::{EntityType, IdMapping, Loader, Record, ResolvedReferences};
use crate::error::{ErrorKind, MigrateError, Result};
use crate::rules::{self, Transformer};
use crate::staging::{Stage, StagingStore};
use crate::state::{BatchRecord, BatchStatus, FailureRecord, Phase};

/// What one batch produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub records_ok: usize,
    pub records_failed: usize,
    /// Records skipped because an earlier attempt already loaded them.
    pub records_skipped: usize,
}

/// Result of one attempt at a batch.
struct Attempt {
    summary: BatchSummary,
    failures: Vec<FailureRecord>,
}

/// Shared by every worker of one (phase, entity type).
pub(crate) struct PhaseWorker {
    pub run_id: String,
    pub project_key: String,
    pub phase: Phase,
    pub entity_type: EntityType,
    pub store: Arc<CheckpointStore>,
    pub staging: Arc<dyn StagingStore>,
    pub loader: Arc<dyn Loader>,
    pub context: Arc<RunContext>,
    pub transformer: Arc<Transformer>,
    pub retry: RetryPolicy,
    pub tracker: Mutex<CommitTracker>,
}

impl PhaseWorker {
    /// Process one batch to completion and commit it.
    ///
    /// Record-level rule violations are ledgered and do not fail the batch.
    /// Any other error is retried per the policy; when it still fails the
    /// batch is recorded as failed, the checkpoint stays behind it, and
    /// the error is returned to stop the phase.
    pub async fn process(&self, mut batch: BatchRecord, records: Vec<Record>) -> Result<BatchSummary> {
        batch.status = BatchStatus::InProgress;
        batch.updated_at = Utc::now();
        let in_progress = batch.clone();
        self.store
            .update(&self.run_id, move |state| state.upsert_batch(in_progress))
            .await?;

        let operation = format!("{}:{}", self.phase, self.entity_type);
        let label = format!("{} batch {}", operation, batch.sequence);
        let (result, attempts) = self
            .retry
            .run(&label, |_| self.context.monitor.time(&operation, self.execute(&records)))
            .await;

        // Attempts from earlier drives of the same page carry over.
        batch.attempt_count += attempts;
        batch.updated_at = Utc::now();

        match result {
            Ok(Attempt { summary, failures }) => {
                batch.records_ok = summary.records_ok;
                batch.records_failed = summary.records_failed;
                let all_rejected = summary.records_ok == 0
                    && summary.records_skipped == 0
                    && summary.records_failed > 0;
                if all_rejected {
                    batch.status = BatchStatus::Failed;
                    batch.last_error = Some(format!(
                        "all {} records failed {}",
                        summary.records_failed, self.phase
                    ));
                } else {
                    batch.status = BatchStatus::Committed;
                }

                let sequence = batch.sequence;
                let end_cursor = batch.end_cursor;
                self.store.finish_batch(batch, failures).await?;

                // Rejected batches are skipped too: their records are in the ledger.
                let mut tracker = self.tracker.lock().await;
                if let Some(cursor) = tracker.complete(sequence, end_cursor) {
                    self.store
                        .advance(&self.run_id, self.phase, self.entity_type, cursor)
                        .await?;
                }

                debug!(
                    "Run {}: {} batch {} committed ({} ok, {} failed, {} skipped)",
                    self.run_id,
                    operation,
                    sequence,
                    summary.records_ok,
                    summary.records_failed,
                    summary.records_skipped
                );
                Ok(summary)
            }
            Err(e) => {
                warn!(
                    "Run {}: {} batch {} failed after {} attempts: {}",
                    self.run_id, operation, batch.sequence, attempts, e
                );
                batch.status = BatchStatus::Failed;
                batch.last_error = Some(e.to_string());
                let failure = FailureRecord {
                    phase: self.phase,
                    entity_type: self.entity_type,
                    record_id: None,
                    cause: e.kind(),
                    message: e.to_string(),
                    at: Utc::now(),
                };
                self.store.finish_batch(batch, vec![failure]).await?;
                Err(e)
            }
        }
    }

    async fn execute(&self, records: &[Record]) -> Result<Attempt> {
        match self.phase {
            Phase::Extract => {
                self.staging
                    .put_records(&self.run_id, Stage::Extracted, self.entity_type, records.to_vec())
                    .await?;
                Ok(Attempt {
                    summary: BatchSummary {
                        records_ok: records.len(),
                        ..Default::default()
                    },
                    failures: Vec::new(),
                })
            }
            Phase::Transform => {
                let mut accepted = Vec::with_capacity(records.len());
                let mut failures = Vec::new();
                for record in records {
                    match self.transformer.transform(record, &self.context.cache).await {
                        Ok(mapped) => accepted.push(mapped),
                        Err(e) => failures.push(self.record_failure(record.id, e)?),
                    }
                }
                self.stage(Stage::Transformed, accepted, failures).await
            }
            Phase::Validate => {
                let mut accepted = Vec::with_capacity(records.len());
                let mut failures = Vec::new();
                for record in records {
                    match rules::validate(record) {
                        Ok(()) => accepted.push(record.clone()),
                        Err(e) => failures.push(self.record_failure(record.id, e)?),
                    }
                }
                self.stage(Stage::Validated, accepted, failures).await
            }
            Phase::Load => self.load(records).await,
            Phase::Done | Phase::Failed => Err(MigrateError::InvalidTransition {
                run_id: self.run_id.clone(),
                message: format!("{} is not a work phase", self.phase),
            }),
        }
    }

    async fn stage(
        &self,
        stage: Stage,
        accepted: Vec<Record>,
        failures: Vec<FailureRecord>,
    ) -> Result<Attempt> {
        let summary = BatchSummary {
            records_ok: accepted.len(),
            records_failed: failures.len(),
            records_skipped: 0,
        };
        if !accepted.is_empty() {
            self.staging
                .put_records(&self.run_id, stage, self.entity_type, accepted)
                .await?;
        }
        Ok(Attempt { summary, failures })
    }

    async fn load(&self, records: &[Record]) -> Result<Attempt> {
        let mut summary = BatchSummary::default();
        let mut failures = Vec::new();
        let load_op = format!("load:{}", self.entity_type);

        for record in records {
            // Loaded by an earlier attempt or an earlier run of this batch.
            if self
                .staging
                .get_mapping(&self.run_id, self.entity_type, record.id)
                .await?
                .is_some()
            {
                summary.records_skipped += 1;
                continue;
            }

            let resolved = match self.resolve_references(record).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    failures.push(self.record_failure(record.id, e)?);
                    continue;
                }
            };

            let loaded = self
                .context
                .monitor
                .time(&load_op, self.loader.load(&self.project_key, record, &resolved))
                .await;
            match loaded {
                Ok(receipt) => {
                    self.staging
                        .put_mapping(
                            &self.run_id,
                            IdMapping {
                                entity_type: self.entity_type,
                                source_id: record.id,
                                destination_id: receipt.destination_id,
                            },
                        )
                        .await?;
                    self.context.cache.insert(
                        RunContext::destination_key(self.entity_type, record.id),
                        Lookup::DestinationId(receipt.destination_id),
                    );
                    summary.records_ok += 1;
                }
                Err(e) => failures.push(self.record_failure(record.id, e)?),
            }
        }

        summary.records_failed = failures.len();
        Ok(Attempt { summary, failures })
    }

    /// Destination ids for a record's references: cache first, then the
    /// id mappings staged by earlier loads.
    async fn resolve_references(&self, record: &Record) -> Result<ResolvedReferences> {
        let mut resolved = ResolvedReferences::new();
        for reference in &record.references {
            let key = RunContext::destination_key(reference.entity_type, reference.source_id);
            let found = self
                .context
                .cache
                .get_or_try_insert_with(&key, || async {
                    Ok(self
                        .staging
                        .get_mapping(&self.run_id, reference.entity_type, reference.source_id)
                        .await?
                        .map(Lookup::DestinationId))
                })
                .await?;

            match found {
                Some(Lookup::DestinationId(id)) => {
                    resolved.insert(reference.field.clone(), id);
                }
                _ => {
                    return Err(MigrateError::validation(
                        record.entity_type,
                        record.id,
                        format!(
                            "{} {} was not loaded",
                            reference.entity_type, reference.source_id
                        ),
                    ))
                }
            }
        }
        Ok(resolved)
    }

    /// Turn a record-level rule violation into a ledger entry; any other
    /// error fails the whole attempt.
    fn record_failure(&self, record_id: i64, error: MigrateError) -> Result<FailureRecord> {
        if error.kind() != ErrorKind::Validation {
            return Err(error);
        }
        Ok(FailureRecord {
            phase: self.phase,
            entity_type: self.entity_type,
            record_id: Some(record_id),
            cause: ErrorKind::Validation,
            message: error.to_string(),
            at: Utc::now(),
        })
    }
}
