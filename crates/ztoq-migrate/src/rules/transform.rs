//! Source to destination record mapping.
//!
//! Transformed records keep their source id (the keyset key for the
//! following phases) and carry their cross-entity links as
//! [`Reference`](crate::core::Reference)s that the load phase resolves to
//! destination ids.

use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::CacheStore;
use crate::context::{Lookup, RunContext};
use crate::core::{EntityType, Record};
use crate::error::{MigrateError, Result};
use crate::staging::{Stage, StagingStore};

/// Deepest folder nesting accepted before the chain is treated as a cycle.
const MAX_FOLDER_DEPTH: usize = 64;

/// Map a source execution status to the destination's test-log status.
///
/// Unknown values are passed through upper-cased so validation rejects them.
pub fn map_execution_status(status: Option<&str>) -> String {
    let raw = status.unwrap_or("NOT_EXECUTED").trim().to_ascii_uppercase();
    match raw.as_str() {
        "PASS" | "PASSED" => "PASSED".to_string(),
        "FAIL" | "FAILED" => "FAILED".to_string(),
        "BLOCKED" => "BLOCKED".to_string(),
        "WIP" | "IN_PROGRESS" => "INCOMPLETE".to_string(),
        "NOT_EXECUTED" | "UNEXECUTED" | "" => "UNEXECUTED".to_string(),
        _ => raw,
    }
}

/// Applies the per-entity mapping rules for one run.
pub struct Transformer {
    run_id: String,
    staging: Arc<dyn StagingStore>,
    attachments_dir: Option<PathBuf>,
}

impl Transformer {
    pub fn new(
        run_id: impl Into<String>,
        staging: Arc<dyn StagingStore>,
        attachments_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            staging,
            attachments_dir,
        }
    }

    /// Transform one extracted record.
    ///
    /// Rule violations are returned as [`MigrateError::Validation`];
    /// staging failures propagate unchanged.
    pub async fn transform(&self, record: &Record, cache: &CacheStore<Lookup>) -> Result<Record> {
        let fields = record.data.as_object().ok_or_else(|| {
            MigrateError::validation(record.entity_type, record.id, "payload is not an object")
        })?;

        match record.entity_type {
            EntityType::Folder => {
                let path = self.folder_path(record, cache).await?;
                Ok(Record::new(
                    record.id,
                    EntityType::Folder,
                    json!({
                        "name": text(fields, "name"),
                        "path": path,
                        "description": text(fields, "description"),
                    }),
                ))
            }
            EntityType::TestCase => {
                let steps: Vec<Value> = fields
                    .get("steps")
                    .and_then(Value::as_array)
                    .map(|steps| {
                        steps
                            .iter()
                            .map(|step| {
                                json!({
                                    "description": step.get("description").and_then(Value::as_str).unwrap_or(""),
                                    "expected": step.get("expectedResult").and_then(Value::as_str).unwrap_or(""),
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                let mapped = Record::new(
                    record.id,
                    EntityType::TestCase,
                    json!({
                        "name": text(fields, "name"),
                        "description": text(fields, "objective"),
                        "precondition": text(fields, "precondition"),
                        "properties": {
                            "priority": fields.get("priority").cloned().unwrap_or(Value::Null),
                            "status": fields.get("status").cloned().unwrap_or(Value::Null),
                            "zephyr_key": fields.get("key").cloned().unwrap_or(Value::Null),
                        },
                        "test_steps": steps,
                    }),
                );
                Ok(match id_field(fields, "folderId") {
                    Some(folder) => mapped.with_reference(EntityType::Folder, folder, "parent_id"),
                    None => mapped,
                })
            }
            EntityType::TestCycle => {
                let mapped = Record::new(
                    record.id,
                    EntityType::TestCycle,
                    json!({
                        "name": text(fields, "name"),
                        "description": text(fields, "description"),
                        "properties": {
                            "zephyr_key": fields.get("key").cloned().unwrap_or(Value::Null),
                        },
                    }),
                );
                Ok(match id_field(fields, "folderId") {
                    Some(folder) => mapped.with_reference(EntityType::Folder, folder, "parent_id"),
                    None => mapped,
                })
            }
            EntityType::Execution => {
                let status = map_execution_status(fields.get("status").and_then(Value::as_str));
                let mut mapped = Record::new(
                    record.id,
                    EntityType::Execution,
                    json!({
                        "status": status,
                        "exe_start_date": fields.get("executedOn").cloned().unwrap_or(Value::Null),
                        "note": text(fields, "comment"),
                    }),
                );
                if let Some(test_case) = id_field(fields, "testCaseId") {
                    mapped = mapped.with_reference(EntityType::TestCase, test_case, "test_case_id");
                }
                if let Some(test_cycle) = id_field(fields, "testCycleId") {
                    mapped = mapped.with_reference(EntityType::TestCycle, test_cycle, "test_cycle_id");
                }
                Ok(mapped)
            }
            EntityType::Attachment => {
                let parent_type = match fields.get("parentType").and_then(Value::as_str) {
                    Some("testCase") => EntityType::TestCase,
                    Some("execution") => EntityType::Execution,
                    other => {
                        return Err(MigrateError::validation(
                            EntityType::Attachment,
                            record.id,
                            format!("unsupported parent type {:?}", other.unwrap_or("none")),
                        ))
                    }
                };
                let name = text(fields, "fileName");
                let path = self
                    .attachments_dir
                    .as_ref()
                    .filter(|_| !name.is_empty())
                    .map(|dir| dir.join(&name).to_string_lossy().into_owned());

                let mapped = Record::new(
                    record.id,
                    EntityType::Attachment,
                    json!({
                        "name": name,
                        "content_type": fields
                            .get("contentType")
                            .and_then(Value::as_str)
                            .unwrap_or("application/octet-stream"),
                        "size": fields.get("size").and_then(Value::as_u64).unwrap_or(0),
                        "path": path,
                    }),
                );
                Ok(match id_field(fields, "parentId") {
                    Some(parent) => mapped.with_reference(parent_type, parent, "parent_id"),
                    None => mapped,
                })
            }
        }
    }

    /// Resolve `/parent/.../name` through cached ancestors and the
    /// extracted folder set, caching every path computed on the way.
    async fn folder_path(&self, folder: &Record, cache: &CacheStore<Lookup>) -> Result<String> {
        if let Some(Lookup::FolderPath(path)) = cache.get(&RunContext::folder_path_key(folder.id)) {
            return Ok(path);
        }

        let mut chain = vec![(folder.id, folder.str_field("name").unwrap_or("").to_string())];
        let mut seen = HashSet::from([folder.id]);
        let mut parent = folder.i64_field("parentId");
        let mut prefix = String::new();

        while let Some(parent_id) = parent {
            if let Some(Lookup::FolderPath(path)) = cache.get(&RunContext::folder_path_key(parent_id)) {
                prefix = path;
                break;
            }
            if !seen.insert(parent_id) || seen.len() > MAX_FOLDER_DEPTH {
                return Err(MigrateError::validation(
                    EntityType::Folder,
                    folder.id,
                    "folder hierarchy contains a cycle",
                ));
            }
            let ancestor = self
                .staging
                .get_record(&self.run_id, Stage::Extracted, EntityType::Folder, parent_id)
                .await?
                .ok_or_else(|| {
                    MigrateError::validation(
                        EntityType::Folder,
                        folder.id,
                        format!("parent folder {} not found", parent_id),
                    )
                })?;
            chain.push((ancestor.id, ancestor.str_field("name").unwrap_or("").to_string()));
            parent = ancestor.i64_field("parentId");
        }

        let mut path = prefix;
        for (id, name) in chain.into_iter().rev() {
            path.push('/');
            path.push_str(&name);
            cache.insert(RunContext::folder_path_key(id), Lookup::FolderPath(path.clone()));
        }
        Ok(path)
    }
}

fn text(fields: &Map<String, Value>, name: &str) -> String {
    fields
        .get(name)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn id_field(fields: &Map<String, Value>, name: &str) -> Option<i64> {
    fields.get(name).and_then(Value::as_i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CachePreset;
    use crate::error::ErrorKind;
    use crate::staging::MemoryStagingStore;

    async fn transformer_with_folders(folders: Vec<Record>) -> Transformer {
        let staging = Arc::new(MemoryStagingStore::new());
        staging
            .put_records("r", Stage::Extracted, EntityType::Folder, folders)
            .await
            .unwrap();
        Transformer::new("r", staging, Some(PathBuf::from("/data/att")))
    }

    fn folder(id: i64, name: &str, parent: Option<i64>) -> Record {
        Record::new(id, EntityType::Folder, json!({"id": id, "name": name, "parentId": parent}))
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_execution_status(Some("PASS")), "PASSED");
        assert_eq!(map_execution_status(Some("fail")), "FAILED");
        assert_eq!(map_execution_status(Some("WIP")), "INCOMPLETE");
        assert_eq!(map_execution_status(None), "UNEXECUTED");
        assert_eq!(map_execution_status(Some("exploded")), "EXPLODED");
    }

    #[tokio::test]
    async fn test_folder_path_uses_ancestors_and_cache() {
        let folders = vec![
            folder(1, "Root", None),
            folder(2, "Auth", Some(1)),
            folder(3, "Login", Some(2)),
        ];
        let transformer = transformer_with_folders(folders.clone()).await;
        let cache = CacheStore::new(CachePreset::ReadOptimized);

        let login = transformer.transform(&folders[2], &cache).await.unwrap();
        assert_eq!(login.data["path"], "/Root/Auth/Login");
        assert_eq!(
            cache.get(&RunContext::folder_path_key(2)),
            Some(Lookup::FolderPath("/Root/Auth".into()))
        );

        let auth = transformer.transform(&folders[1], &cache).await.unwrap();
        assert_eq!(auth.data["path"], "/Root/Auth");
        assert!(cache.stats().hits >= 1);
    }

    #[tokio::test]
    async fn test_folder_cycle_is_a_validation_failure() {
        let folders = vec![folder(1, "A", Some(2)), folder(2, "B", Some(1))];
        let transformer = transformer_with_folders(folders.clone()).await;
        let cache = CacheStore::new(CachePreset::ReadOptimized);

        let err = transformer.transform(&folders[0], &cache).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_test_case_mapping() {
        let transformer = transformer_with_folders(Vec::new()).await;
        let cache = CacheStore::new(CachePreset::ReadOptimized);
        let source = Record::new(
            10,
            EntityType::TestCase,
            json!({
                "id": 10,
                "key": "PRJ-T10",
                "name": "Login works",
                "objective": "Check login",
                "folderId": 3,
                "priority": "High",
                "steps": [{"description": "open page", "expectedResult": "page shown"}]
            }),
        );

        let mapped = transformer.transform(&source, &cache).await.unwrap();
        assert_eq!(mapped.id, 10);
        assert_eq!(mapped.data["description"], "Check login");
        assert_eq!(mapped.data["properties"]["zephyr_key"], "PRJ-T10");
        assert_eq!(mapped.data["test_steps"][0]["expected"], "page shown");
        assert_eq!(mapped.references.len(), 1);
        assert_eq!(mapped.references[0].entity_type, EntityType::Folder);
        assert_eq!(mapped.references[0].source_id, 3);
    }

    #[tokio::test]
    async fn test_execution_references_case_and_cycle() {
        let transformer = transformer_with_folders(Vec::new()).await;
        let cache = CacheStore::new(CachePreset::ReadOptimized);
        let source = Record::new(
            5,
            EntityType::Execution,
            json!({"testCaseId": 10, "testCycleId": 20, "status": "PASS", "comment": "ok"}),
        );

        let mapped = transformer.transform(&source, &cache).await.unwrap();
        assert_eq!(mapped.data["status"], "PASSED");
        assert_eq!(mapped.data["note"], "ok");
        let fields: Vec<&str> = mapped.references.iter().map(|r| r.field.as_str()).collect();
        assert_eq!(fields, vec!["test_case_id", "test_cycle_id"]);
    }

    #[tokio::test]
    async fn test_attachment_parent_and_path() {
        let transformer = transformer_with_folders(Vec::new()).await;
        let cache = CacheStore::new(CachePreset::ReadOptimized);
        let source = Record::new(
            8,
            EntityType::Attachment,
            json!({"parentType": "execution", "parentId": 5, "fileName": "log.txt", "size": 12}),
        );

        let mapped = transformer.transform(&source, &cache).await.unwrap();
        assert_eq!(mapped.data["path"], "/data/att/log.txt");
        assert_eq!(mapped.data["content_type"], "application/octet-stream");
        assert_eq!(mapped.references[0].entity_type, EntityType::Execution);

        let orphan = Record::new(9, EntityType::Attachment, json!({"parentType": "wiki"}));
        let err = transformer.transform(&orphan, &cache).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
