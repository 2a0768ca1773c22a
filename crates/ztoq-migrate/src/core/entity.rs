//! Entity types and the static dependency table.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{MigrateError, Result};

/// Kind of migrated record.
///
/// Variant order is a valid topological order of [`DEPENDENCIES`]; the
/// scheduler relies on it when resolving processing order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Folder,
    TestCase,
    TestCycle,
    Execution,
    Attachment,
}

/// Entity type -> entity types it references.
const DEPENDENCIES: &[(EntityType, &[EntityType])] = &[
    (EntityType::Folder, &[]),
    (EntityType::TestCase, &[EntityType::Folder]),
    (EntityType::TestCycle, &[EntityType::Folder]),
    (
        EntityType::Execution,
        &[EntityType::TestCase, EntityType::TestCycle],
    ),
    (
        EntityType::Attachment,
        &[EntityType::TestCase, EntityType::Execution],
    ),
];

impl EntityType {
    /// All entity types in dependency order.
    pub const ALL: [EntityType; 5] = [
        EntityType::Folder,
        EntityType::TestCase,
        EntityType::TestCycle,
        EntityType::Execution,
        EntityType::Attachment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Folder => "folder",
            EntityType::TestCase => "test_case",
            EntityType::TestCycle => "test_cycle",
            EntityType::Execution => "execution",
            EntityType::Attachment => "attachment",
        }
    }

    /// Entity types this one references.
    pub fn dependencies(&self) -> &'static [EntityType] {
        DEPENDENCIES
            .iter()
            .find(|(entity, _)| entity == self)
            .map(|(_, deps)| *deps)
            .unwrap_or(&[])
    }

    /// Resolve a selection into processing order.
    ///
    /// The selection is closed over dependencies (selecting `execution`
    /// pulls in `test_case`, `test_cycle` and `folder`) and returned in
    /// dependency order. An empty selection means every entity type.
    pub fn resolve_order(selected: &[EntityType]) -> Vec<EntityType> {
        if selected.is_empty() {
            return Self::ALL.to_vec();
        }

        let mut included: Vec<EntityType> = Vec::new();
        let mut stack: Vec<EntityType> = selected.to_vec();
        while let Some(entity) = stack.pop() {
            if included.contains(&entity) {
                continue;
            }
            included.push(entity);
            stack.extend_from_slice(entity.dependencies());
        }

        Self::ALL
            .iter()
            .copied()
            .filter(|e| included.contains(e))
            .collect()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|e| e.as_str() == normalized)
            .ok_or_else(|| MigrateError::Config(format!("Unknown entity type: {}", s)))
    }
}
