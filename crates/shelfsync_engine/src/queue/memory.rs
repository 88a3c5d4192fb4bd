//! In-memory queue store.

use super::index::RowIndex;
use super::{QueueSnapshot, QueueStore};
use crate::error::SyncResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use shelfsync_protocol::{OperationId, PendingOperation};
use std::sync::atomic::{AtomicUsize, Ordering};

/// A [`QueueStore`] that keeps rows in memory.
///
/// Nothing survives the process, but the store outlives any single
/// [`PendingOperationQueue`](super::PendingOperationQueue), which makes it
/// useful for exercising reload paths in tests.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    index: Mutex<RowIndex>,
    writes: AtomicUsize,
}

impl MemoryQueueStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of writes received so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of live rows.
    pub fn len(&self) -> usize {
        self.index.lock().live()
    }

    /// Returns true if no rows are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn load(&self) -> SyncResult<QueueSnapshot> {
        Ok(self.index.lock().snapshot())
    }

    async fn put(&self, op: PendingOperation) -> SyncResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.index.lock().apply_put(op);
        Ok(())
    }

    async fn remove(&self, id: OperationId, revision: u64) -> SyncResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.index.lock().apply_remove(id, revision);
        Ok(())
    }
}
