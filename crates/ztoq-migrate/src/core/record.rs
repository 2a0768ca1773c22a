//! Records moved through the pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::entity::EntityType;

/// Reference from one record to a record of another entity type, by source id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Referenced entity type.
    pub entity_type: EntityType,
    /// Source-side id of the referenced record.
    pub source_id: i64,
    /// Destination field the resolved id is written to.
    pub field: String,
}

/// A single migrated record.
///
/// `id` is the source's unique, monotonically assigned identifier and is
/// the keyset pagination key in every phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    pub entity_type: EntityType,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<Reference>,
}

impl Record {
    pub fn new(id: i64, entity_type: EntityType, data: Value) -> Self {
        Self {
            id,
            entity_type,
            data,
            references: Vec::new(),
        }
    }

    /// Add a reference to another record.
    pub fn with_reference(
        mut self,
        entity_type: EntityType,
        source_id: i64,
        field: impl Into<String>,
    ) -> Self {
        self.references.push(Reference {
            entity_type,
            source_id,
            field: field.into(),
        });
        self
    }

    /// Get a string field from the payload.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.data.get(name).and_then(Value::as_str)
    }

    /// Get an integer field from the payload.
    pub fn i64_field(&self, name: &str) -> Option<i64> {
        self.data.get(name).and_then(Value::as_i64)
    }
}

/// Destination ids for a record's references, keyed by destination field.
pub type ResolvedReferences = BTreeMap<String, i64>;

/// Source id -> destination id produced by the load phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    pub entity_type: EntityType,
    pub source_id: i64,
    pub destination_id: i64,
}
