//! State backend trait for run state storage.
//!
//! The [`StateBackend`] trait decouples run state persistence from the
//! workflow. Two implementations ship with the crate:
//!
//! - **File**: one signed JSON document per run, in `file.rs`
//! - **Memory**: process-local map for tests and dry runs, in `memory.rs`
//!
//! The controller works with `Arc<dyn StateBackend>` without knowing the
//! concrete type.

use async_trait::async_trait;

use super::{MigrationRun, RunState};
use crate::error::Result;

/// Trait for run state persistence backends.
///
/// Implementations must be `Send + Sync` to allow sharing across async tasks.
///
/// # Example
///
/// ```rust,ignore
/// let backend: Arc<dyn StateBackend> = Arc::new(FileStateBackend::new(".ztoq"));
/// backend.init().await?;
/// backend.save(&state).await?;
/// let loaded = backend.load(&run_id).await?;
/// ```
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Prepare the storage location. Idempotent.
    async fn init(&self) -> Result<()>;

    /// Persist the complete document, replacing any previous version.
    ///
    /// Must be atomic: a crash leaves either the old or the new document.
    async fn save(&self, state: &RunState) -> Result<()>;

    /// Load a run by id, or `None` if it does not exist.
    async fn load(&self, run_id: &str) -> Result<Option<RunState>>;

    /// Most recently created run for a project.
    async fn load_latest(&self, project_key: &str) -> Result<Option<RunState>> {
        let mut runs = self.list_runs().await?;
        runs.retain(|r| r.project_key == project_key);
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        match runs.pop() {
            Some(run) => self.load(&run.run_id).await,
            None => Ok(None),
        }
    }

    /// Remove a run's document. Returns whether one existed.
    async fn delete(&self, run_id: &str) -> Result<bool>;

    /// Headers of every stored run.
    async fn list_runs(&self) -> Result<Vec<MigrationRun>>;

    /// Backend type name for logging.
    fn backend_type(&self) -> &'static str;
}
