//! Validation rules applied to transformed records.

use crate::core::{EntityType, Record};
use crate::error::{MigrateError, Result};

/// Longest accepted name, in characters.
pub const MAX_NAME_LEN: usize = 500;

/// Largest accepted attachment, in bytes.
pub const MAX_ATTACHMENT_SIZE: u64 = 50 * 1024 * 1024;

/// Test-log statuses the destination accepts.
pub const DESTINATION_STATUSES: [&str; 5] =
    ["PASSED", "FAILED", "BLOCKED", "INCOMPLETE", "UNEXECUTED"];

/// Check a transformed record against its entity type's rules.
pub fn validate(record: &Record) -> Result<()> {
    let fail = |message: String| MigrateError::validation(record.entity_type, record.id, message);

    for reference in &record.references {
        if reference.source_id <= 0 {
            return Err(fail(format!(
                "{} reference {} is not a valid id",
                reference.entity_type, reference.source_id
            )));
        }
    }

    match record.entity_type {
        EntityType::Folder | EntityType::TestCase | EntityType::TestCycle => {
            check_name(record).map_err(fail)?;
        }
        EntityType::Execution => {
            let status = record.str_field("status").unwrap_or("");
            if !DESTINATION_STATUSES.contains(&status) {
                return Err(fail(format!("unknown execution status {:?}", status)));
            }
            for required in [EntityType::TestCase, EntityType::TestCycle] {
                if !record.references.iter().any(|r| r.entity_type == required) {
                    return Err(fail(format!("missing {} reference", required)));
                }
            }
        }
        EntityType::Attachment => {
            check_name(record).map_err(fail)?;
            let size = record.data.get("size").and_then(|v| v.as_u64()).unwrap_or(0);
            if size > MAX_ATTACHMENT_SIZE {
                return Err(fail(format!(
                    "attachment is {} bytes, limit is {}",
                    size, MAX_ATTACHMENT_SIZE
                )));
            }
            if record.references.is_empty() {
                return Err(fail("missing parent reference".to_string()));
            }
        }
    }

    Ok(())
}

fn check_name(record: &Record) -> std::result::Result<(), String> {
    let name = record.str_field("name").unwrap_or("");
    if name.trim().is_empty() {
        return Err("name is empty".to_string());
    }
    let len = name.chars().count();
    if len > MAX_NAME_LEN {
        return Err(format!("name is {} characters, limit is {}", len, MAX_NAME_LEN));
    }
    Ok(())
}
