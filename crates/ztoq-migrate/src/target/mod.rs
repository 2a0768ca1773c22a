//! Destination collaborators.

mod jsonl;

pub use jsonl::JsonlLoader;
