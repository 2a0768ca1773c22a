//! In-process staging store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;

use super::{Stage, StagingStore};
use crate::core::{EntityType, IdMapping, Record};
use crate::error::Result;

type StageKey = (String, Stage, EntityType);
type MappingKey = (String, EntityType);

/// Staged records held in memory, sharded per (run, stage, entity type).
#[derive(Debug, Default)]
pub struct MemoryStagingStore {
    records: DashMap<StageKey, BTreeMap<i64, Record>>,
    mappings: DashMap<MappingKey, BTreeMap<i64, i64>>,
}

impl MemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StagingStore for MemoryStagingStore {
    async fn put_records(
        &self,
        run_id: &str,
        stage: Stage,
        entity_type: EntityType,
        records: Vec<Record>,
    ) -> Result<()> {
        let mut set = self
            .records
            .entry((run_id.to_string(), stage, entity_type))
            .or_default();
        for record in records {
            set.insert(record.id, record);
        }
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
        let key = (run_id.to_string(), stage, entity_type);
        let Some(set) = self.records.get(&key) else {
            return Ok(Vec::new());
        };
        Ok(page_of(&set, after_id, limit))
    }

    async fn get_record(
        &self,
        run_id: &str,
        stage: Stage,
        entity_type: EntityType,
        id: i64,
    ) -> Result<Option<Record>> {
        let key = (run_id.to_string(), stage, entity_type);
        Ok(self
            .records
            .get(&key)
            .and_then(|set| set.get(&id).cloned()))
    }

    async fn count(&self, run_id: &str, stage: Stage, entity_type: EntityType) -> Result<u64> {
        let key = (run_id.to_string(), stage, entity_type);
        Ok(self.records.get(&key).map(|set| set.len() as u64).unwrap_or(0))
    }

    async fn put_mapping(&self, run_id: &str, mapping: IdMapping) -> Result<()> {
        self.mappings
            .entry((run_id.to_string(), mapping.entity_type))
            .or_default()
            .insert(mapping.source_id, mapping.destination_id);
        Ok(())
    }

    async fn get_mapping(
        &self,
        run_id: &str,
        entity_type: EntityType,
        source_id: i64,
    ) -> Result<Option<i64>> {
        Ok(self
            .mappings
            .get(&(run_id.to_string(), entity_type))
            .and_then(|map| map.get(&source_id).copied()))
    }

    async fn purge(&self, run_id: &str) -> Result<()> {
        self.records.retain(|(run, _, _), _| run != run_id);
        self.mappings.retain(|(run, _), _| run != run_id);
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

/// Keyset slice of an ordered record set.
pub(super) fn page_of(set: &BTreeMap<i64, Record>, after_id: Option<i64>, limit: usize) -> Vec<Record> {
    use std::ops::Bound;

    let lower = match after_id {
        Some(id) => Bound::Excluded(id),
        None => Bound::Unbounded,
    };
    set.range((lower, Bound::Unbounded))
        .take(limit)
        .map(|(_, record)| record.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: i64, name: &str) -> Record {
        Record::new(id, EntityType::TestCase, json!({ "name": name }))
    }

    #[tokio::test]
    async fn test_put_is_an_upsert() {
        let store = MemoryStagingStore::new();
        store
            .put_records("r", Stage::Transformed, EntityType::TestCase, vec![record(1, "a"), record(2, "b")])
            .await
            .unwrap();
        store
            .put_records("r", Stage::Transformed, EntityType::TestCase, vec![record(2, "b2")])
            .await
            .unwrap();

        assert_eq!(store.count("r", Stage::Transformed, EntityType::TestCase).await.unwrap(), 2);
        let updated = store
            .get_record("r", Stage::Transformed, EntityType::TestCase, 2)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.str_field("name"), Some("b2"));
    }

    #[tokio::test]
    async fn test_page_is_keyset_ordered() {
        let store = MemoryStagingStore::new();
        let records = [9, 3, 5, 1].iter().map(|id| record(*id, "x")).collect();
        store
            .put_records("r", Stage::Extracted, EntityType::TestCase, records)
            .await
            .unwrap();

        let ids: Vec<i64> = store
            .page("r", Stage::Extracted, EntityType::TestCase, Some(3), 10)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![5, 9]);
    }

    #[tokio::test]
    async fn test_runs_are_isolated_and_purged() {
        let store = MemoryStagingStore::new();
        store
            .put_records("a", Stage::Extracted, EntityType::TestCase, vec![record(1, "x")])
            .await
            .unwrap();
        store
            .put_records("b", Stage::Extracted, EntityType::TestCase, vec![record(1, "y")])
            .await
            .unwrap();
        store
            .put_mapping(
                "a",
                IdMapping {
                    entity_type: EntityType::TestCase,
                    source_id: 1,
                    destination_id: 100,
                },
            )
            .await
            .unwrap();

        store.purge("a").await.unwrap();
        assert_eq!(store.count("a", Stage::Extracted, EntityType::TestCase).await.unwrap(), 0);
        assert_eq!(store.get_mapping("a", EntityType::TestCase, 1).await.unwrap(), None);
        assert_eq!(store.count("b", Stage::Extracted, EntityType::TestCase).await.unwrap(), 1);
    }
}
