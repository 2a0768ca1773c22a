//! Source collaborators.

mod export;

pub use export::ExportDirFetcher;
