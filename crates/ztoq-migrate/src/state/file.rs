//! JSON file state backend.
//!
//! Each run is stored as `<dir>/<run_id>.json`. Writes go to a temp file
//! that is renamed over the target, so a crash mid-write never leaves a
//! truncated document behind.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{MigrationRun, RunState, StateBackend};
use crate::error::{MigrateError, Result};

/// Stores signed run documents in a directory.
#[derive(Debug, Clone)]
pub struct FileStateBackend {
    dir: PathBuf,
}

impl FileStateBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: &str) -> Result<PathBuf> {
        if run_id.is_empty()
            || !run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(MigrateError::RunNotFound(run_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", run_id)))
    }

    async fn read_state(path: &Path) -> Result<RunState> {
        let content = tokio::fs::read_to_string(path).await?;
        let state: RunState = serde_json::from_str(&content).map_err(|e| {
            MigrateError::State(format!("Corrupt state file {}: {}", path.display(), e))
        })?;
        state.verify()?;
        Ok(state)
    }
}

#[async_trait]
impl StateBackend for FileStateBackend {
    async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    async fn save(&self, state: &RunState) -> Result<()> {
        let path = self.path_for(state.run_id())?;

        let mut signed = state.clone();
        signed.sign()?;

        let content = serde_json::to_string_pretty(&signed)
            .map_err(|e| MigrateError::State(format!("Failed to serialize state: {}", e)))?;

        // Atomic write: write to temp file, then rename
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &content).await?;
        tokio::fs::rename(&temp_path, &path).await?;

        debug!("Saved run {} to {}", state.run_id(), path.display());
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<RunState>> {
        let path = self.path_for(run_id)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        Self::read_state(&path).await.map(Some)
    }

    async fn delete(&self, run_id: &str) -> Result<bool> {
        let path = self.path_for(run_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_runs(&self) -> Result<Vec<MigrationRun>> {
        let mut runs = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(runs),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_state(&path).await {
                Ok(state) => runs.push(state.run),
                Err(e) => warn!("Skipping unreadable state file {}: {}", path.display(), e),
            }
        }

        Ok(runs)
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}
