//! Writes loaded records to JSON-lines files.
//!
//! Each entity type goes to `<output_dir>/<project_key>/<entity_type>.jsonl`.
//! Destination ids are assigned per file, continuing after the lines
//! already present so a resumed run never reuses an id.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::core::{EntityType, LoadReceipt, Loader, Record, ResolvedReferences};
use crate::error::Result;

struct OutputFile {
    file: tokio::fs::File,
    next_id: i64,
}

/// Appends loaded records to per-entity JSON-lines files.
pub struct JsonlLoader {
    output_dir: PathBuf,
    files: DashMap<(String, EntityType), Arc<Mutex<Option<OutputFile>>>>,
}

impl JsonlLoader {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            files: DashMap::new(),
        }
    }

    fn path_for(&self, project_key: &str, entity_type: EntityType) -> PathBuf {
        self.output_dir
            .join(project_key)
            .join(format!("{}.jsonl", entity_type))
    }

    async fn open(&self, path: &PathBuf) -> Result<OutputFile> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let existing = if tokio::fs::try_exists(path).await? {
            tokio::fs::read_to_string(path)
                .await?
                .lines()
                .filter(|line| !line.trim().is_empty())
                .count() as i64
        } else {
            0
        };
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(OutputFile {
            file,
            next_id: existing + 1,
        })
    }
}

#[async_trait]
impl Loader for JsonlLoader {
    async fn load(
        &self,
        project_key: &str,
        record: &Record,
        resolved: &ResolvedReferences,
    ) -> Result<LoadReceipt> {
        let slot = self
            .files
            .entry((project_key.to_string(), record.entity_type))
            .or_default()
            .clone();

        // A failed write leaves the slot empty; the next load reopens the
        // file and recounts its lines.
        let mut guard = slot.lock().await;
        let mut output = match guard.take() {
            Some(output) => output,
            None => {
                let path = self.path_for(project_key, record.entity_type);
                self.open(&path).await?
            }
        };

        let destination_id = output.next_id;
        let mut line = serde_json::to_vec(&json!({
            "id": destination_id,
            "source_id": record.id,
            "entity_type": record.entity_type,
            "data": record.data,
            "links": resolved,
        }))?;
        line.push(b'\n');
        output.file.write_all(&line).await?;
        output.file.flush().await?;
        output.next_id += 1;
        *guard = Some(output);

        Ok(LoadReceipt { destination_id })
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}

impl std::fmt::Debug for JsonlLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlLoader")
            .field("output_dir", &self.output_dir)
            .finish()
    }
}
