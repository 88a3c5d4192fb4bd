//! Revision-resolved view of persisted queue rows.

use super::QueueSnapshot;
use shelfsync_protocol::{OperationId, PendingOperation};
use std::collections::{BTreeMap, HashMap};

/// Latest known state of every row, resolved by revision.
///
/// Writes may reach a store out of order; the higher revision always wins,
/// so replaying the same records in any order yields the same rows.
#[derive(Debug, Default)]
pub(crate) struct RowIndex {
    rows: BTreeMap<OperationId, PendingOperation>,
    revisions: HashMap<OperationId, u64>,
    max_id: u64,
    max_revision: u64,
}

impl RowIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Applies an upsert. Returns false if a newer revision is already known.
    pub(crate) fn apply_put(&mut self, op: PendingOperation) -> bool {
        if !self.observe(op.id, op.revision) {
            return false;
        }
        self.rows.insert(op.id, op);
        true
    }

    /// Applies a removal. Returns false if a newer revision is already known.
    pub(crate) fn apply_remove(&mut self, id: OperationId, revision: u64) -> bool {
        if !self.observe(id, revision) {
            return false;
        }
        self.rows.remove(&id);
        true
    }

    /// Raises the id and revision high-water marks.
    pub(crate) fn apply_watermark(&mut self, next_id: u64, next_revision: u64) {
        self.max_id = self.max_id.max(next_id.saturating_sub(1));
        self.max_revision = self.max_revision.max(next_revision.saturating_sub(1));
    }

    pub(crate) fn live(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn rows(&self) -> impl Iterator<Item = &PendingOperation> {
        self.rows.values()
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.max_id + 1
    }

    pub(crate) fn next_revision(&self) -> u64 {
        self.max_revision + 1
    }

    pub(crate) fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            operations: self.rows.values().cloned().collect(),
            next_id: self.next_id(),
            next_revision: self.next_revision(),
        }
    }

    fn observe(&mut self, id: OperationId, revision: u64) -> bool {
        self.max_id = self.max_id.max(id.get());
        self.max_revision = self.max_revision.max(revision);
        match self.revisions.get(&id) {
            Some(known) if *known >= revision => false,
            _ => {
                self.revisions.insert(id, revision);
                true
            }
        }
    }
}
