//! Staging store backed by append-only JSON-lines journals.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<run_id>/<stage>/<entity_type>.jsonl   one record per line
//! <root>/<run_id>/id_map/<entity_type>.jsonl    one id mapping per line
//! ```
//!
//! A write appends only the new lines, so staging a batch costs the size
//! of the batch. On first use a journal is replayed into memory; a later
//! line for the same id replaces an earlier one. An unreadable final line
//! is the tail of a write cut short by a crash and is ignored, since its
//! batch never committed and is staged again on resume.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::memory::page_of;
use super::{Stage, StagingStore};
use crate::core::{EntityType, IdMapping, Record};
use crate::error::{MigrateError, Result};

type Shared<T> = Arc<Mutex<T>>;

/// Durable staging for the CLI.
#[derive(Debug)]
pub struct FileStagingStore {
    root: PathBuf,
    records: DashMap<PathBuf, Shared<BTreeMap<i64, Record>>>,
    mappings: DashMap<PathBuf, Shared<BTreeMap<i64, i64>>>,
}

impl FileStagingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            records: DashMap::new(),
            mappings: DashMap::new(),
        }
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        if run_id.is_empty()
            || !run_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(MigrateError::RunNotFound(run_id.to_string()));
        }
        Ok(self.root.join(run_id))
    }

    fn records_path(&self, run_id: &str, stage: Stage, entity_type: EntityType) -> Result<PathBuf> {
        Ok(self
            .run_dir(run_id)?
            .join(stage.as_str())
            .join(format!("{}.jsonl", entity_type)))
    }

    fn mapping_path(&self, run_id: &str, entity_type: EntityType) -> Result<PathBuf> {
        Ok(self
            .run_dir(run_id)?
            .join("id_map")
            .join(format!("{}.jsonl", entity_type)))
    }
}

/// Open a journal, replaying it from disk on first use.
async fn open<T, L>(
    cache: &DashMap<PathBuf, Shared<BTreeMap<i64, T>>>,
    path: &Path,
    entry: impl Fn(L) -> (i64, T),
) -> Result<Shared<BTreeMap<i64, T>>>
where
    L: DeserializeOwned,
{
    let cached = cache.get(path).map(|doc| doc.value().clone());
    if let Some(doc) = cached {
        return Ok(doc);
    }

    let mut value = BTreeMap::new();
    if tokio::fs::try_exists(path).await? {
        let content = tokio::fs::read_to_string(path).await?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        for (i, line) in lines.iter().enumerate() {
            match serde_json::from_str::<L>(line) {
                Ok(parsed) => {
                    let (id, item) = entry(parsed);
                    value.insert(id, item);
                }
                Err(e) if i + 1 == lines.len() => {
                    warn!("Ignoring truncated last line of {}: {}", path.display(), e);
                }
                Err(e) => {
                    return Err(MigrateError::State(format!(
                        "Corrupt staging file {} at line {}: {}",
                        path.display(),
                        i + 1,
                        e
                    )))
                }
            }
        }
    }

    Ok(cache
        .entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(value)))
        .clone())
}

/// Append one JSON line per item and flush.
async fn append_lines<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut buf = Vec::new();
    for item in items {
        serde_json::to_writer(&mut buf, item)?;
        buf.push(b'\n');
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&buf).await?;
    file.flush().await?;
    Ok(())
}

fn record_entry(record: Record) -> (i64, Record) {
    (record.id, record)
}

fn mapping_entry(mapping: IdMapping) -> (i64, i64) {
    (mapping.source_id, mapping.destination_id)
}

#[async_trait]
impl StagingStore for FileStagingStore {
    async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn put_records(
        &self,
        run_id: &str,
        stage: Stage,
        entity_type: EntityType,
        records: Vec<Record>,
    ) -> Result<()> {
        let path = self.records_path(run_id, stage, entity_type)?;
        let doc = open(&self.records, &path, record_entry).await?;
        let mut set = doc.lock().await;
        let count = records.len();
        // Held across the append so lines land in the order of the map updates.
        append_lines(&path, &records).await?;
        for record in records {
            set.insert(record.id, record);
        }
        debug!(
            "Run {}: staged {} {} records ({})",
            run_id, count, entity_type, stage
        );
        Ok(())
    }

    async fn page(
        &self,
        run_id: &str,
        stage: Stage,
        entity_type: EntityType,
        after_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let path = self.records_path(run_id, stage, entity_type)?;
        let doc = open(&self.records, &path, record_entry).await?;
        let set = doc.lock().await;
        Ok(page_of(&set, after_id, limit))
    }

    async fn get_record(
        &self,
        run_id: &str,
        stage: Stage,
        entity_type: EntityType,
        id: i64,
    ) -> Result<Option<Record>> {
        let path = self.records_path(run_id, stage, entity_type)?;
        let doc = open(&self.records, &path, record_entry).await?;
        let set = doc.lock().await;
        Ok(set.get(&id).cloned())
    }

    async fn count(&self, run_id: &str, stage: Stage, entity_type: EntityType) -> Result<u64> {
        let path = self.records_path(run_id, stage, entity_type)?;
        let doc = open(&self.records, &path, record_entry).await?;
        let set = doc.lock().await;
        Ok(set.len() as u64)
    }

    async fn put_mapping(&self, run_id: &str, mapping: IdMapping) -> Result<()> {
        let path = self.mapping_path(run_id, mapping.entity_type)?;
        let doc = open(&self.mappings, &path, mapping_entry).await?;
        let mut map = doc.lock().await;
        append_lines(&path, std::slice::from_ref(&mapping)).await?;
        map.insert(mapping.source_id, mapping.destination_id);
        Ok(())
    }

    async fn get_mapping(
        &self,
        run_id: &str,
        entity_type: EntityType,
        source_id: i64,
    ) -> Result<Option<i64>> {
        let path = self.mapping_path(run_id, entity_type)?;
        let doc = open(&self.mappings, &path, mapping_entry).await?;
        let map = doc.lock().await;
        Ok(map.get(&source_id).copied())
    }

    async fn purge(&self, run_id: &str) -> Result<()> {
        let dir = self.run_dir(run_id)?;
        self.records.retain(|path, _| !path.starts_with(&dir));
        self.mappings.retain(|path, _| !path.starts_with(&dir));
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn backend_type(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let store = FileStagingStore::new(dir.path());
        store.init().await.unwrap();
        let records = (1..=3)
            .map(|id| Record::new(id, EntityType::TestCycle, json!({"name": "c"})))
            .collect();
        store
            .put_records("run-1", Stage::Validated, EntityType::TestCycle, records)
            .await
            .unwrap();

        let reopened = FileStagingStore::new(dir.path());
        let page = reopened
            .page("run-1", Stage::Validated, EntityType::TestCycle, Some(1), 10)
            .await
            .unwrap();
        assert_eq!(page.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_mappings_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let store = FileStagingStore::new(dir.path());
        store
            .put_mapping(
                "run-1",
                IdMapping {
                    entity_type: EntityType::Folder,
                    source_id: 4,
                    destination_id: 9004,
                },
            )
            .await
            .unwrap();

        let reopened = FileStagingStore::new(dir.path());
        assert_eq!(
            reopened.get_mapping("run-1", EntityType::Folder, 4).await.unwrap(),
            Some(9004)
        );
        assert_eq!(
            reopened.get_mapping("run-1", EntityType::Folder, 5).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_restaging_appends_and_replays_latest_version() {
        let dir = TempDir::new().unwrap();
        let store = FileStagingStore::new(dir.path());
        let batch = |name: &str| {
            (1..=2)
                .map(|id| Record::new(id, EntityType::Folder, json!({ "name": name })))
                .collect::<Vec<_>>()
        };
        store
            .put_records("run-3", Stage::Extracted, EntityType::Folder, batch("old"))
            .await
            .unwrap();
        store
            .put_records("run-3", Stage::Extracted, EntityType::Folder, batch("new"))
            .await
            .unwrap();

        let path = dir.path().join("run-3/extracted/folder.jsonl");
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 4);

        // A crash in the middle of the next append leaves a partial line.
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut file, b"{\"id\": 3, \"enti").unwrap();

        let reopened = FileStagingStore::new(dir.path());
        assert_eq!(
            reopened.count("run-3", Stage::Extracted, EntityType::Folder).await.unwrap(),
            2
        );
        let record = reopened
            .get_record("run-3", Stage::Extracted, EntityType::Folder, 2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.data["name"], "new");
    }

    #[tokio::test]
    async fn test_corrupt_line_before_the_end_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run-4/id_map/folder.jsonl");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            "not json\n{\"entity_type\":\"folder\",\"source_id\":1,\"destination_id\":7}\n",
        )
        .unwrap();

        let store = FileStagingStore::new(dir.path());
        let err = store
            .get_mapping("run-4", EntityType::Folder, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::State(_)));
    }

    #[tokio::test]
    async fn test_purge_removes_run_directory() {
        let dir = TempDir::new().unwrap();
        let store = FileStagingStore::new(dir.path());
        store
            .put_records(
                "run-2",
                Stage::Extracted,
                EntityType::Folder,
                vec![Record::new(1, EntityType::Folder, json!({}))],
            )
            .await
            .unwrap();
        assert!(dir.path().join("run-2").exists());

        store.purge("run-2").await.unwrap();
        assert!(!dir.path().join("run-2").exists());
        assert_eq!(
            store.count("run-2", Stage::Extracted, EntityType::Folder).await.unwrap(),
            0
        );
        // Purging twice is fine.
        store.purge("run-2").await.unwrap();
    }
}
