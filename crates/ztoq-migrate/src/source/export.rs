//! Reads records from a JSON export directory.
//!
//! Each entity type is a file `<export_dir>/<project_key>/<entity_type>.json`
//! holding an array of objects with a numeric `id`. A missing file means
//! the project has no records of that type.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::core::{EntityType, FetchRequest, Fetcher, Record};
use crate::error::{MigrateError, Result};

/// Serves keyset pages from exported JSON files.
#[derive(Debug)]
pub struct ExportDirFetcher {
    export_dir: PathBuf,
    loaded: DashMap<(String, EntityType), Arc<Vec<Record>>>,
}

impl ExportDirFetcher {
    pub fn new(export_dir: impl Into<PathBuf>) -> Self {
        Self {
            export_dir: export_dir.into(),
            loaded: DashMap::new(),
        }
    }

    fn path_for(&self, project_key: &str, entity_type: EntityType) -> PathBuf {
        self.export_dir
            .join(project_key)
            .join(format!("{}.json", entity_type))
    }

    /// All records of one type, sorted by id. Read once per process.
    async fn records(&self, project_key: &str, entity_type: EntityType) -> Result<Arc<Vec<Record>>> {
        let key = (project_key.to_string(), entity_type);
        let cached = self.loaded.get(&key).map(|r| r.value().clone());
        if let Some(records) = cached {
            return Ok(records);
        }

        let path = self.path_for(project_key, entity_type);
        let records = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            parse_export(entity_type, &content)?
        } else {
            debug!("No export for {} at {}", entity_type, path.display());
            Vec::new()
        };

        Ok(self
            .loaded
            .entry(key)
            .or_insert_with(|| Arc::new(records))
            .clone())
    }
}

fn parse_export(entity_type: EntityType, content: &str) -> Result<Vec<Record>> {
    let value: Value = serde_json::from_str(content)
        .map_err(|e| MigrateError::schema_mismatch(entity_type, format!("invalid JSON: {}", e)))?;
    let items = match value {
        Value::Array(items) => items,
        _ => {
            return Err(MigrateError::schema_mismatch(
                entity_type,
                "export must be a JSON array",
            ))
        }
    };

    let mut records = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let id = item.get("id").and_then(Value::as_i64).ok_or_else(|| {
            MigrateError::schema_mismatch(
                entity_type,
                format!("element {} has no numeric id", index),
            )
        })?;
        records.push(Record::new(id, entity_type, item));
    }
    records.sort_by_key(|r| r.id);
    records.dedup_by_key(|r| r.id);
    Ok(records)
}

#[async_trait]
impl Fetcher for ExportDirFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<Record>> {
        let records = self
            .records(&request.project_key, request.entity_type)
            .await?;
        let start = match request.after_id {
            Some(after) => records.partition_point(|r| r.id <= after),
            None => 0,
        };
        Ok(records
            .iter()
            .skip(start)
            .take(request.limit)
            .cloned()
            .collect())
    }

    async fn estimate_total(&self, project_key: &str, entity_type: EntityType) -> Result<Option<u64>> {
        Ok(Some(self.records(project_key, entity_type).await?.len() as u64))
    }

    fn name(&self) -> &str {
        "export-dir"
    }
}
