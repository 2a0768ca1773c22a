//! Collaborator capabilities consumed by the engine.
//!
//! - [`Fetcher`]: Reads keyset pages of records from a source
//! - [`Loader`]: Writes one transformed record to the destination
//!
//! Concrete HTTP clients for the source and destination services live
//! outside this crate; the engine only depends on these traits. The
//! staging store also implements [`Fetcher`] so every phase pages the
//! same way.

use async_trait::async_trait;

use super::entity::EntityType;
use super::record::{Record, ResolvedReferences};
use crate::error::Result;

/// Request for one keyset page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Project being migrated.
    pub project_key: String,
    /// Entity type to page over.
    pub entity_type: EntityType,
    /// Return only records with `id > after_id` (None = from the beginning).
    pub after_id: Option<i64>,
    /// Maximum records to return.
    pub limit: usize,
}

/// Read records from a source in ascending id order.
///
/// # Contract
///
/// Implementations return at most `limit` records whose id is strictly
/// greater than `after_id`, ordered by id. Returning fewer than `limit`
/// records signals the end of the set.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch one page of records.
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<Record>>;

    /// Estimated number of records, when the source can tell cheaply.
    async fn estimate_total(
        &self,
        _project_key: &str,
        _entity_type: EntityType,
    ) -> Result<Option<u64>> {
        Ok(None)
    }

    /// Name used in logs and performance reports.
    fn name(&self) -> &str;
}

/// Result of loading one record into the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadReceipt {
    /// Id assigned by the destination.
    pub destination_id: i64,
}

/// Write transformed records to the destination service.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Create one record; `resolved` holds destination ids for its references.
    async fn load(
        &self,
        project_key: &str,
        record: &Record,
        resolved: &ResolvedReferences,
    ) -> Result<LoadReceipt>;

    /// Name used in logs and performance reports.
    fn name(&self) -> &str;
}
