//! In-process state backend.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{MigrationRun, RunState, StateBackend};
use crate::error::Result;

/// Keeps run documents in memory. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStateBackend {
    runs: RwLock<HashMap<String, RunState>>,
}

impl MemoryStateBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateBackend for MemoryStateBackend {
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn save(&self, state: &RunState) -> Result<()> {
        let mut signed = state.clone();
        signed.sign()?;
        self.runs
            .write()
            .await
            .insert(signed.run.run_id.clone(), signed);
        Ok(())
    }

    async fn load(&self, run_id: &str) -> Result<Option<RunState>> {
        let runs = self.runs.read().await;
        match runs.get(run_id) {
            Some(state) => {
                state.verify()?;
                Ok(Some(state.clone()))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, run_id: &str) -> Result<bool> {
        Ok(self.runs.write().await.remove(run_id).is_some())
    }

    async fn list_runs(&self) -> Result<Vec<MigrationRun>> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .map(|s| s.run.clone())
            .collect())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MigrationConfig;

    #[tokio::test]
    async fn test_save_load_delete() {
        let backend = MemoryStateBackend::new();
        let state = RunState::new("r1".into(), "PRJ".into(), MigrationConfig::default());
        backend.save(&state).await.unwrap();

        let loaded = backend.load("r1").await.unwrap().unwrap();
        assert_eq!(loaded.run, state.run);
        assert!(loaded.hmac.is_some());

        assert!(backend.delete("r1").await.unwrap());
        assert!(backend.load("r1").await.unwrap().is_none());
        assert!(!backend.delete("r1").await.unwrap());
    }

    #[tokio::test]
    async fn test_load_latest_by_project() {
        let backend = MemoryStateBackend::new();
        let mut first = RunState::new("a".into(), "PRJ".into(), MigrationConfig::default());
        first.run.created_at = first.run.created_at - chrono::Duration::hours(1);
        let second = RunState::new("b".into(), "PRJ".into(), MigrationConfig::default());
        let other = RunState::new("c".into(), "OTHER".into(), MigrationConfig::default());
        for s in [&first, &second, &other] {
            backend.save(s).await.unwrap();
        }

        let latest = backend.load_latest("PRJ").await.unwrap().unwrap();
        assert_eq!(latest.run.run_id, "b");
        assert!(backend.load_latest("NONE").await.unwrap().is_none());
    }
}
