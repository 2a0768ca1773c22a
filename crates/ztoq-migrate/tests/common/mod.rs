//! Scripted collaborators for workflow tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ztoq_migrate::{
    EntityType, FetchRequest, Fetcher, LoadReceipt, Loader, MemoryStagingStore,
    MemoryStateBackend, MigrateError, MigrationConfig, Record, ResolvedReferences, RetryConfig,
    Result, StagingStore, StateBackend, WorkflowController,
};

pub const PROJECT: &str = "DEMO";

/// Fault injected into the next matching call.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Transient,
    Unauthorized,
}

impl Fault {
    fn error(self, operation: &str) -> MigrateError {
        match self {
            Fault::Transient => MigrateError::transient(operation, "503 service unavailable"),
            Fault::Unauthorized => MigrateError::unauthorized(operation, "401 token expired"),
        }
    }
}

/// In-memory source with a fetch log and per-cursor fault injection.
#[derive(Default)]
pub struct ScriptedFetcher {
    data: HashMap<EntityType, Vec<Record>>,
    log: Mutex<Vec<(EntityType, Option<i64>)>>,
    faults: Mutex<HashMap<(EntityType, Option<i64>), (Fault, u32)>>,
    delay: Option<Duration>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, entity_type: EntityType, mut records: Vec<Record>) -> Self {
        records.sort_by_key(|r| r.id);
        self.data.insert(entity_type, records);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next `times` fetches of `entity_type` starting after `after_id`.
    pub fn fail_at(&self, entity_type: EntityType, after_id: Option<i64>, fault: Fault, times: u32) {
        self.faults
            .lock()
            .unwrap()
            .insert((entity_type, after_id), (fault, times));
    }

    pub fn clear_faults(&self) {
        self.faults.lock().unwrap().clear();
    }

    /// Every fetch attempted so far, in order.
    pub fn calls(&self) -> Vec<(EntityType, Option<i64>)> {
        self.log.lock().unwrap().clone()
    }

    pub fn calls_for(&self, entity_type: EntityType) -> Vec<Option<i64>> {
        self.calls()
            .into_iter()
            .filter(|(e, _)| *e == entity_type)
            .map(|(_, after)| after)
            .collect()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<Vec<Record>> {
        self.log
            .lock()
            .unwrap()
            .push((request.entity_type, request.after_id));

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let fault = {
            let mut faults = self.faults.lock().unwrap();
            let key = (request.entity_type, request.after_id);
            match faults.get_mut(&key) {
                Some((fault, remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(*fault)
                }
                _ => None,
            }
        };
        if let Some(fault) = fault {
            return Err(fault.error("fetch"));
        }

        let records = self
            .data
            .get(&request.entity_type)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
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

    async fn estimate_total(&self, _project_key: &str, entity_type: EntityType) -> Result<Option<u64>> {
        Ok(self.data.get(&entity_type).map(|r| r.len() as u64))
    }

    fn name(&self) -> &str {
        "scripted-source"
    }
}

/// One record accepted by the destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded {
    pub entity_type: EntityType,
    pub source_id: i64,
    pub destination_id: i64,
    pub resolved: ResolvedReferences,
}

/// Destination double assigning sequential ids.
pub struct ScriptedLoader {
    next_id: AtomicI64,
    loaded: Mutex<Vec<Loaded>>,
    calls: AtomicU32,
    transient_failures: AtomicU32,
    always_fail: Mutex<Option<Fault>>,
    record_faults: Mutex<HashMap<(EntityType, i64), Fault>>,
    reject: Mutex<HashSet<(EntityType, i64)>>,
}

impl Default for ScriptedLoader {
    fn default() -> Self {
        Self {
            next_id: AtomicI64::new(1000),
            loaded: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
            transient_failures: AtomicU32::new(0),
            always_fail: Mutex::new(None),
            record_faults: Mutex::new(HashMap::new()),
            reject: Mutex::new(HashSet::new()),
        }
    }
}

impl ScriptedLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` calls fail with a transient error.
    pub fn fail_transiently(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_always(&self, fault: Option<Fault>) {
        *self.always_fail.lock().unwrap() = fault;
    }

    /// Every load of one record fails with `fault` until cleared.
    pub fn fail_record(&self, entity_type: EntityType, source_id: i64, fault: Fault) {
        self.record_faults
            .lock()
            .unwrap()
            .insert((entity_type, source_id), fault);
    }

    pub fn clear_record_faults(&self) {
        self.record_faults.lock().unwrap().clear();
    }

    /// Reject one record as invalid.
    pub fn reject(&self, entity_type: EntityType, source_id: i64) {
        self.reject.lock().unwrap().insert((entity_type, source_id));
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn loaded(&self) -> Vec<Loaded> {
        self.loaded.lock().unwrap().clone()
    }

    pub fn loaded_ids(&self, entity_type: EntityType) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .loaded()
            .into_iter()
            .filter(|l| l.entity_type == entity_type)
            .map(|l| l.source_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn destination_of(&self, entity_type: EntityType, source_id: i64) -> Option<i64> {
        self.loaded()
            .into_iter()
            .find(|l| l.entity_type == entity_type && l.source_id == source_id)
            .map(|l| l.destination_id)
    }
}

#[async_trait]
impl Loader for ScriptedLoader {
    async fn load(
        &self,
        _project_key: &str,
        record: &Record,
        resolved: &ResolvedReferences,
    ) -> Result<LoadReceipt> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(fault) = *self.always_fail.lock().unwrap() {
            return Err(fault.error("load"));
        }
        let record_fault = self
            .record_faults
            .lock()
            .unwrap()
            .get(&(record.entity_type, record.id))
            .copied();
        if let Some(fault) = record_fault {
            return Err(fault.error("load"));
        }
        let pending = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending.is_ok() {
            return Err(Fault::Transient.error("load"));
        }
        if self
            .reject
            .lock()
            .unwrap()
            .contains(&(record.entity_type, record.id))
        {
            return Err(MigrateError::validation(
                record.entity_type,
                record.id,
                "rejected by destination",
            ));
        }

        let destination_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.loaded.lock().unwrap().push(Loaded {
            entity_type: record.entity_type,
            source_id: record.id,
            destination_id,
            resolved: resolved.clone(),
        });
        Ok(LoadReceipt { destination_id })
    }

    fn name(&self) -> &str {
        "scripted-target"
    }
}

/// Controller wired to in-memory stores, with handles to every collaborator.
pub struct Harness {
    pub controller: Arc<WorkflowController>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub loader: Arc<ScriptedLoader>,
    pub state: Arc<MemoryStateBackend>,
    pub staging: Arc<MemoryStagingStore>,
}

impl Harness {
    pub async fn new(fetcher: ScriptedFetcher) -> Self {
        Self::with_stores(
            Arc::new(fetcher),
            Arc::new(ScriptedLoader::new()),
            Arc::new(MemoryStateBackend::new()),
            Arc::new(MemoryStagingStore::new()),
        )
        .await
    }

    pub async fn with_stores(
        fetcher: Arc<ScriptedFetcher>,
        loader: Arc<ScriptedLoader>,
        state: Arc<MemoryStateBackend>,
        staging: Arc<MemoryStagingStore>,
    ) -> Self {
        let controller = WorkflowController::new(
            fetcher.clone() as Arc<dyn Fetcher>,
            loader.clone() as Arc<dyn Loader>,
            state.clone() as Arc<dyn StateBackend>,
            staging.clone() as Arc<dyn StagingStore>,
        );
        controller.init().await.unwrap();
        Self {
            controller: Arc::new(controller),
            fetcher,
            loader,
            state,
            staging,
        }
    }

    /// A fresh controller over the same collaborators and stores, as after a restart.
    pub async fn restart(&self) -> Self {
        Self::with_stores(
            self.fetcher.clone(),
            self.loader.clone(),
            self.state.clone(),
            self.staging.clone(),
        )
        .await
    }
}

/// Config with small batches, a fixed worker count and fast retries.
pub fn config(entity_types: &[EntityType], batch_size: usize, max_workers: usize) -> MigrationConfig {
    MigrationConfig {
        batch_size,
        max_workers: Some(max_workers),
        entity_types: entity_types.to_vec(),
        retry: RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        },
        ..Default::default()
    }
}

pub fn folder(id: i64, name: &str, parent: Option<i64>) -> Record {
    Record::new(
        id,
        EntityType::Folder,
        json!({"id": id, "name": name, "parentId": parent}),
    )
}

pub fn test_case(id: i64, name: &str, folder: Option<i64>) -> Record {
    Record::new(
        id,
        EntityType::TestCase,
        json!({"id": id, "key": format!("{}-T{}", PROJECT, id), "name": name, "folderId": folder}),
    )
}

pub fn test_cycle(id: i64, name: &str, folder: Option<i64>) -> Record {
    Record::new(
        id,
        EntityType::TestCycle,
        json!({"id": id, "key": format!("{}-R{}", PROJECT, id), "name": name, "folderId": folder}),
    )
}

pub fn execution(id: i64, test_case: i64, test_cycle: i64, status: &str) -> Record {
    Record::new(
        id,
        EntityType::Execution,
        json!({"id": id, "testCaseId": test_case, "testCycleId": test_cycle, "status": status}),
    )
}

pub fn attachment(id: i64, parent_type: &str, parent: i64, file_name: &str) -> Record {
    Record::new(
        id,
        EntityType::Attachment,
        json!({
            "id": id,
            "parentType": parent_type,
            "parentId": parent,
            "fileName": file_name,
            "contentType": "text/plain",
            "size": 128,
        }),
    )
}

/// A small project touching every entity type.
pub fn sample_project() -> ScriptedFetcher {
    ScriptedFetcher::new()
        .with(
            EntityType::Folder,
            vec![
                folder(1, "Root", None),
                folder(2, "Auth", Some(1)),
                folder(3, "Login", Some(2)),
            ],
        )
        .with(
            EntityType::TestCase,
            vec![
                test_case(10, "Valid password", Some(3)),
                test_case(11, "Wrong password", Some(3)),
                test_case(12, "Locked account", Some(2)),
                test_case(13, "Logout", Some(1)),
                test_case(14, "Session timeout", None),
            ],
        )
        .with(
            EntityType::TestCycle,
            vec![test_cycle(20, "Sprint 1", Some(1)), test_cycle(21, "Sprint 2", None)],
        )
        .with(
            EntityType::Execution,
            vec![
                execution(30, 10, 20, "PASS"),
                execution(31, 11, 20, "FAIL"),
                execution(32, 12, 21, "WIP"),
                execution(33, 13, 21, "NOT_EXECUTED"),
            ],
        )
        .with(
            EntityType::Attachment,
            vec![
                attachment(40, "testCase", 10, "screenshot.png"),
                attachment(41, "execution", 31, "trace.log"),
            ],
        )
}

/// `n` test cases with ids `1..=n`; ids in `empty_names` get a blank name.
pub fn numbered_test_cases(n: i64, empty_names: std::ops::RangeInclusive<i64>) -> Vec<Record> {
    (1..=n)
        .map(|id| {
            let name = if empty_names.contains(&id) {
                String::new()
            } else {
                format!("Case {}", id)
            };
            test_case(id, &name, None)
        })
        .collect()
}

pub fn numbered_folders(n: i64) -> Vec<Record> {
    (1..=n).map(|id| folder(id, &format!("F{}", id), None)).collect()
}

/// Counts loads per (entity type, source id); anything above 1 is a duplicate.
pub fn duplicate_loads(loaded: &[Loaded]) -> BTreeMap<(EntityType, i64), usize> {
    let mut counts = BTreeMap::new();
    for l in loaded {
        *counts.entry((l.entity_type, l.source_id)).or_insert(0) += 1;
    }
    counts.retain(|_, n| *n > 1);
    counts
}
