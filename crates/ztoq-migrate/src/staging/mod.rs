//! Intermediate record sets between phases.
//!
//! Extract writes source records to the `extracted` stage, transform reads
//! them and writes `transformed`, validate writes the survivors to
//! `validated`, and load reads `validated` and records source id ->
//! destination id mappings. Every phase after extract reads its input
//! through [`StagedSource`], so pagination and resume behave the same as
//! against the real source.

mod file;
mod memory;

pub use file::FileStagingStore;
pub use memory::MemoryStagingStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::core::{EntityType, FetchRequest, Fetcher, IdMapping, Record};
use crate::error::Result;
use crate::state::Phase;

/// A staged record set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extracted,
    Transformed,
    Validated,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extracted => "extracted",
            Stage::Transformed => "transformed",
            Stage::Validated => "validated",
        }
    }

    /// Stage a phase reads its records from. `None` means the source.
    pub fn input_of(phase: Phase) -> Option<Stage> {
        match phase {
            Phase::Transform => Some(Stage::Extracted),
            Phase::Validate => Some(Stage::Transformed),
            Phase::Load => Some(Stage::Validated),
            _ => None,
        }
    }

    /// Stage a phase writes its records to. Load writes id mappings instead.
    pub fn output_of(phase: Phase) -> Option<Stage> {
        match phase {
            Phase::Extract => Some(Stage::Extracted),
            Phase::Transform => Some(Stage::Transformed),
            Phase::Validate => Some(Stage::Validated),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage for staged records and id mappings, scoped by run.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Prepare the storage location. Idempotent.
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Insert or replace records by id.
    async fn put_records(
        &self,
        run_id: &str,
        stage: Stage,
        entity_type: EntityType,
        records: Vec<Record>,
    ) -> Result<()>;

    /// Up to `limit` records with id greater than `after_id`, ascending.
    async fn page(
        &self,
        run_id: &str,
        stage: Stage,
        entity_type: EntityType,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Record>>;

    async fn get_record(
        &self,
        run_id: &str,
        stage: Stage,
        entity_type: EntityType,
        id: i64,
    ) -> Result<Option<Record>>;

    async fn count(&self, run_id: &str, stage: Stage, entity_type: EntityType) -> Result<u64>;

    async fn put_mapping(&self, run_id: &str, mapping: IdMapping) -> Result<()>;

    async fn get_mapping(
        &self,
        run_id: &str,
        entity_type: EntityType,
        source_id: i64,
    ) -> Result<Option<i64>>;

    /// Remove everything staged for a run.
    async fn purge(&self, run_id: &str) -> Result<()>;

    fn backend_type(&self) -> &'static str;
}

/// Serves a staged record set through the [`Fetcher`] interface.
pub struct StagedSource {
    staging: Arc<dyn StagingStore>,
    run_id: String,
    stage: Stage,
    name: String,
}

impl StagedSource {
    pub fn new(staging: Arc<dyn StagingStore>, run_id: impl Into<String>, stage: Stage) -> Self {
        Self {
            staging,
            run_id: run_id.into(),
            stage,
            name: format!("staging:{}", stage),
        }
    }
}

#[async_trait]
impl Fetcher for StagedSource {
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<Record>> {
        self.staging
            .page(
                &self.run_id,
                self.stage,
                request.entity_type,
                request.after_id,
                request.limit,
            )
            .await
    }

    async fn estimate_total(
        &self,
        _project_key: &str,
        entity_type: EntityType,
    ) -> Result<Option<u64>> {
        self.staging
            .count(&self.run_id, self.stage, entity_type)
            .await
            .map(Some)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
