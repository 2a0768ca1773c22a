//! Keyset pagination.
//!
//! Positions are the last-seen record id, never an offset, so records
//! inserted or deleted while a run is in progress cannot shift pages
//! and cause skipped or duplicated records. A [`Cursor`] carries no
//! session state: feeding any previously returned cursor back into
//! [`PaginationCursor::next`] yields exactly the records after it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::entity::EntityType;
use super::record::Record;
use super::traits::{FetchRequest, Fetcher};
use crate::error::{MigrateError, Result};

/// Position token for keyset pagination.
///
/// Ordering is `Start < After(_) < End`, with `After` ordered by id.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Cursor {
    /// Before the first record.
    #[default]
    Start,
    /// After the record with this id.
    After(i64),
    /// No more pages.
    End,
}

impl Cursor {
    /// The exclusive lower bound for the next fetch.
    pub fn after_id(&self) -> Option<i64> {
        match self {
            Cursor::After(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Cursor::End)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cursor::Start => f.write_str("start"),
            Cursor::After(id) => write!(f, "after:{}", id),
            Cursor::End => f.write_str("end"),
        }
    }
}

/// One page of records.
#[derive(Debug, Clone)]
pub struct Page {
    /// Records in ascending id order.
    pub records: Vec<Record>,
    /// Cursor to continue from (`End` once `done`).
    pub next_cursor: Cursor,
    /// True when the fetch returned fewer records than requested.
    pub done: bool,
}

impl Page {
    fn finished() -> Self {
        Self {
            records: Vec::new(),
            next_cursor: Cursor::End,
            done: true,
        }
    }

    /// Position immediately after this page's last record.
    pub fn end_position(&self) -> Option<Cursor> {
        self.records.last().map(|r| Cursor::After(r.id))
    }

    pub fn first_id(&self) -> Option<i64> {
        self.records.first().map(|r| r.id)
    }

    pub fn last_id(&self) -> Option<i64> {
        self.records.last().map(|r| r.id)
    }
}

/// Keyset pager over a [`Fetcher`] for one project.
#[derive(Clone)]
pub struct PaginationCursor {
    fetcher: Arc<dyn Fetcher>,
    project_key: String,
}

impl PaginationCursor {
    pub fn new(fetcher: Arc<dyn Fetcher>, project_key: impl Into<String>) -> Self {
        Self {
            fetcher,
            project_key: project_key.into(),
        }
    }

    /// Name of the underlying fetcher.
    pub fn source_name(&self) -> &str {
        self.fetcher.name()
    }

    /// Fetch the page following `after`.
    pub async fn next(
        &self,
        entity_type: EntityType,
        after: Cursor,
        page_size: usize,
    ) -> Result<Page> {
        if page_size == 0 {
            return Err(MigrateError::Config("page size must be at least 1".into()));
        }
        if after.is_end() {
            return Ok(Page::finished());
        }

        let after_id = after.after_id();
        let request = FetchRequest {
            project_key: self.project_key.clone(),
            entity_type,
            after_id,
            limit: page_size,
        };
        let mut records = self.fetcher.fetch(&request).await?;

        // Never trust the fetcher with ordering or bounds.
        if let Some(bound) = after_id {
            records.retain(|r| r.id > bound);
        }
        records.sort_by_key(|r| r.id);
        records.dedup_by_key(|r| r.id);
        records.truncate(page_size);

        let done = records.len() < page_size;
        let next_cursor = match (done, records.last()) {
            (true, _) | (false, None) => Cursor::End,
            (false, Some(last)) => Cursor::After(last.id),
        };

        Ok(Page {
            records,
            next_cursor,
            done,
        })
    }
}

impl fmt::Debug for PaginationCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaginationCursor")
            .field("fetcher", &self.fetcher.name())
            .field("project_key", &self.project_key)
            .finish()
    }
}
