//! Workflow controller - drives runs through extract, transform, validate
//! and load.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::config::MigrationConfig;
use crate::context::RunContext;
use crate::core::{EntityType, Fetcher, Loader};
use crate::error::{MigrateError, Result};
use crate::scheduler::{BatchScheduler, PhaseOutcome, RetryPolicy};
use crate::staging::StagingStore;
use crate::state::{MigrationRun, Phase, RunError, RunSnapshot, RunState, RunStatus, StateBackend};

/// What [`WorkflowController::cleanup`] removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub run_id: String,
    pub checkpoints_removed: usize,
    pub staging_purged: bool,
    pub run_deleted: bool,
}

/// Top-level state machine for migration runs.
pub struct WorkflowController {
    source: Arc<dyn Fetcher>,
    loader: Arc<dyn Loader>,
    store: Arc<CheckpointStore>,
    staging: Arc<dyn StagingStore>,
    cancel: Mutex<CancellationToken>,
}

impl WorkflowController {
    pub fn new(
        source: Arc<dyn Fetcher>,
        loader: Arc<dyn Loader>,
        state: Arc<dyn StateBackend>,
        staging: Arc<dyn StagingStore>,
    ) -> Self {
        Self {
            source,
            loader,
            store: Arc::new(CheckpointStore::new(state)),
            staging,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Prepare state and staging storage.
    pub async fn init(&self) -> Result<()> {
        self.store.init().await?;
        self.staging.init().await
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    /// Request an operator stop.
    ///
    /// In-flight batches finish and commit, no new batch is dispatched and
    /// the run is left `paused`.
    pub fn pause(&self) {
        self.current_token().cancel();
    }

    fn current_token(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace a token consumed by a pause so the next drive can run.
    fn rearm(&self) {
        let mut token = self
            .cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    /// Create a run and drive it to completion.
    ///
    /// Returns the run id. The run is `running` while it is driven; one
    /// that stops on an error is marked `failed` with its cause recorded,
    /// and the error is returned.
    pub async fn start(&self, project_key: &str, config: MigrationConfig) -> Result<String> {
        let run_id = self.create(project_key, config).await?;
        self.store
            .update(&run_id, |state| state.run.mark_running())
            .await??;
        self.drive(&run_id, Phase::Load).await?;
        Ok(run_id)
    }

    /// Register a run without processing anything yet. It starts `paused`
    /// in extract and is driven by [`advance_to`](Self::advance_to) or
    /// [`resume`](Self::resume).
    pub async fn create(&self, project_key: &str, config: MigrationConfig) -> Result<String> {
        if project_key.trim().is_empty() {
            return Err(MigrateError::Config("project key is required".into()));
        }
        config.validate()?;

        let run_id = Uuid::new_v4().to_string();
        let mut state = RunState::new(run_id.clone(), project_key.to_string(), config);
        state.run.mark_paused();
        self.store.create(state).await?;
        Ok(run_id)
    }

    /// Continue a paused, failed or interrupted run from its checkpoints.
    ///
    /// A completed run is left untouched.
    pub async fn resume(&self, run_id: &str) -> Result<String> {
        self.advance_to(run_id, Phase::Load).await
    }

    /// Drive a run up to and including `phase`, then leave it `paused`.
    pub async fn advance_to(&self, run_id: &str, phase: Phase) -> Result<String> {
        if !phase.is_work() {
            return Err(MigrateError::Config(format!("{} is not a work phase", phase)));
        }

        let run = self.store.run(run_id).await?;
        if run.status == RunStatus::Completed {
            info!("Run {} already completed, nothing to do", run_id);
            return Ok(run_id.to_string());
        }
        if run.status != RunStatus::Failed && run.phase > phase {
            info!("Run {} is already past {}", run_id, phase);
            return Ok(run_id.to_string());
        }

        self.store
            .update(run_id, |state| state.run.mark_running())
            .await??;
        info!("Resuming run {} at {}", run_id, self.store.run(run_id).await?.phase);

        self.drive(run_id, phase).await?;
        Ok(run_id.to_string())
    }

    /// Current phase, per-entity progress, failures and last error.
    pub async fn status(&self, run_id: &str) -> Result<RunSnapshot> {
        self.store.snapshot(run_id).await
    }

    /// Most recently started run for a project.
    pub async fn latest_run(&self, project_key: &str) -> Result<Option<MigrationRun>> {
        self.store.latest_run(project_key).await
    }

    /// Remove checkpoints and staged data of a run that is not running.
    ///
    /// With `purge` the run document is deleted as well.
    pub async fn cleanup(&self, run_id: &str, purge: bool) -> Result<CleanupReport> {
        let run = self.store.run(run_id).await?;
        if run.status == RunStatus::Running {
            return Err(MigrateError::InvalidTransition {
                run_id: run_id.to_string(),
                message: "cannot clean up a running run; pause it or let it finish first".into(),
            });
        }

        let checkpoints_removed = self.store.cleanup(run_id).await?;
        self.staging.purge(run_id).await?;
        let run_deleted = if purge {
            self.store.delete(run_id).await?
        } else {
            false
        };

        info!(
            "Cleaned up run {} ({} checkpoints, staging purged{})",
            run_id,
            checkpoints_removed,
            if run_deleted { ", run deleted" } else { "" }
        );
        Ok(CleanupReport {
            run_id: run_id.to_string(),
            checkpoints_removed,
            staging_purged: true,
            run_deleted,
        })
    }

    /// Run phases in order until `until` is done, the run completes, or
    /// something stops it.
    async fn drive(&self, run_id: &str, until: Phase) -> Result<()> {
        let state = self.store.state(run_id).await?;
        let config = state.config.clone();
        let span = info_span!("run", run_id = %run_id, project = %state.run.project_key);
        // A pause requested before this point still stops the drive.
        let cancel = self.current_token();

        async {
            let context = Arc::new(RunContext::new(&config));
            let scheduler = BatchScheduler::new(
                self.source.clone(),
                self.loader.clone(),
                self.store.clone(),
                self.staging.clone(),
                context.clone(),
                RetryPolicy::from_config(&config.retry),
                config.attachments_dir.clone(),
                cancel.clone(),
            );
            let entity_order = config.entity_order();

            let result = self
                .run_phases(run_id, until, &config, &entity_order, &scheduler)
                .await;
            if let Err(ref e) = result {
                self.fail_if_running(run_id, e).await;
            }

            self.rearm();
            let report = context.finish(run_id);
            self.store
                .update(run_id, move |state| state.performance = Some(report))
                .await?;

            result
        }
        .instrument(span)
        .await
    }

    async fn run_phases(
        &self,
        run_id: &str,
        until: Phase,
        config: &MigrationConfig,
        entity_order: &[EntityType],
        scheduler: &BatchScheduler,
    ) -> Result<()> {
        loop {
            let phase = self.store.run(run_id).await?.phase;
            if phase == Phase::Done {
                info!("Run {} completed", run_id);
                return Ok(());
            }
            if phase > until {
                self.store.update(run_id, |state| state.run.mark_paused()).await?;
                info!("Run {} paused before {}", run_id, phase);
                return Ok(());
            }

            let result = match scheduler
                .run_phase(
                    run_id,
                    phase,
                    entity_order,
                    config.batch_size,
                    config.get_max_workers(),
                )
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    self.record_failure(run_id, phase, None, &e).await?;
                    return Err(e);
                }
            };

            info!(
                "Run {}: {} committed {} records, {} failed",
                run_id,
                phase,
                result.records_committed(),
                result.records_failed()
            );

            match result.outcome {
                PhaseOutcome::Completed => {
                    self.ensure_phase_complete(run_id, phase, entity_order).await?;
                    let next = self
                        .store
                        .update(run_id, |state| state.run.complete_phase(phase))
                        .await??;
                    info!("Run {}: {} -> {}", run_id, phase, next);
                }
                PhaseOutcome::Paused => {
                    self.store.update(run_id, |state| state.run.mark_paused()).await?;
                    info!("Run {} paused during {}", run_id, phase);
                    return Err(MigrateError::Cancelled);
                }
                PhaseOutcome::Failed { entity_type, error } => {
                    self.record_failure(run_id, phase, Some(entity_type), &error)
                        .await?;
                    return Err(error);
                }
            }
        }
    }

    /// A phase is done only when every entity type reached `End`.
    async fn ensure_phase_complete(
        &self,
        run_id: &str,
        phase: Phase,
        entity_order: &[EntityType],
    ) -> Result<()> {
        for entity_type in entity_order {
            let cursor = self.store.read(run_id, phase, *entity_type).await?;
            if !cursor.is_end() {
                return Err(MigrateError::InvalidTransition {
                    run_id: run_id.to_string(),
                    message: format!(
                        "{} for {} stopped at {} before the end of its input",
                        phase, entity_type, cursor
                    ),
                });
            }
        }
        Ok(())
    }

    /// Mark a run that stopped on an error outside the scheduler as
    /// `failed`, so it is never left `running` without a cause.
    async fn fail_if_running(&self, run_id: &str, err: &MigrateError) {
        if matches!(err, MigrateError::Cancelled) {
            return;
        }
        let run = match self.store.run(run_id).await {
            Ok(run) => run,
            Err(e) => {
                error!("Run {}: cannot read state to record failure: {}", run_id, e);
                return;
            }
        };
        if run.status != RunStatus::Running {
            return;
        }
        if let Err(e) = self.record_failure(run_id, run.resume_phase(), None, err).await {
            error!("Run {}: cannot record failure: {}", run_id, e);
        }
    }

    async fn record_failure(
        &self,
        run_id: &str,
        phase: Phase,
        entity_type: Option<EntityType>,
        err: &MigrateError,
    ) -> Result<()> {
        error!("Run {} failed during {}: {}", run_id, phase, err);
        let run_error = RunError {
            kind: err.kind(),
            message: err.to_string(),
            phase,
            entity_type,
            at: Utc::now(),
        };
        self.store
            .update(run_id, move |state| {
                state.last_error = Some(run_error);
                state.run.mark_failed();
            })
            .await
    }
}

impl std::fmt::Debug for WorkflowController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowController")
            .field("source", &self.source.name())
            .field("loader", &self.loader.name())
            .field("store", &self.store)
            .field("staging", &self.staging.backend_type())
            .finish()
    }
}
