//! Core migration abstractions.
//!
//! - [`entity`]: Entity types and their static dependency table
//! - [`record`]: Records moved through the pipeline and their references
//! - [`cursor`]: Keyset pagination over any [`Fetcher`]
//! - [`traits`]: Collaborator capabilities (source [`Fetcher`], destination [`Loader`])

pub mod cursor;
pub mod entity;
pub mod record;
pub mod traits;

pub use cursor::{Cursor, Page, PaginationCursor};
pub use entity::EntityType;
pub use record::{IdMapping, Record, Reference, ResolvedReferences};
pub use traits::{FetchRequest, Fetcher, LoadReceipt, Loader};
