//! Releases checkpoint positions only once every earlier batch committed.

use std::collections::BTreeMap;

use crate::core::Cursor;

/// Orders out-of-order batch completions.
///
/// Batches are numbered in dispatch order. With parallel workers they may
/// finish out of order; the tracker holds later completions until the
/// sequence is contiguous and only then reports the next safe checkpoint,
/// so the checkpoint never points past a batch that is still in flight.
#[derive(Debug)]
pub struct CommitTracker {
    /// Finished batches not yet released, by sequence.
    completed: BTreeMap<u64, Cursor>,
    /// Next sequence that must finish before anything is released.
    next_sequence: u64,
    /// Highest released position.
    released: Cursor,
}

impl CommitTracker {
    pub fn new(start: Cursor) -> Self {
        Self {
            completed: BTreeMap::new(),
            next_sequence: 0,
            released: start,
        }
    }

    /// Mark a batch finished at `end_cursor`.
    ///
    /// Returns the new safe checkpoint when this completion extends the
    /// contiguous prefix, `None` when it has to wait for an earlier batch.
    pub fn complete(&mut self, sequence: u64, end_cursor: Cursor) -> Option<Cursor> {
        if sequence < self.next_sequence {
            return None;
        }
        self.completed.insert(sequence, end_cursor);

        let mut advanced = false;
        while let Some(cursor) = self.completed.remove(&self.next_sequence) {
            if cursor > self.released {
                self.released = cursor;
            }
            self.next_sequence += 1;
            advanced = true;
        }

        advanced.then_some(self.released)
    }

    /// Highest position released so far.
    pub fn released(&self) -> Cursor {
        self.released
    }

    /// Number of finished batches waiting on an earlier one.
    pub fn pending(&self) -> usize {
        self.completed.len()
    }
}
