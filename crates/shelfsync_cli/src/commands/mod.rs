//! Command implementations.

pub mod compact;
pub mod discard;
pub mod dump_queue;
pub mod inspect;
pub mod retry;

use shelfsync_engine::{
    JournalConfig, JournalQueueStore, PendingOperationQueue, SyncError, DEFAULT_MAX_RETRIES,
};
use shelfsync_storage::FileBackend;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors raised by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// No journal exists at the given path.
    #[error("no queue journal found at {0:?}")]
    JournalNotFound(PathBuf),

    /// The queue rejected the request.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Output could not be encoded.
    #[error("output encoding failed: {0}")]
    Output(#[from] serde_json::Error),
}

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Opens an existing journal. Commands never create one.
pub fn open_journal(path: &Path) -> CliResult<Arc<JournalQueueStore<FileBackend>>> {
    if !path.is_file() {
        return Err(CliError::JournalNotFound(path.to_path_buf()));
    }
    debug!(?path, "opening queue journal");
    Ok(Arc::new(JournalQueueStore::open_file(
        path,
        JournalConfig::default(),
    )?))
}

/// Opens the queue held by an existing journal.
pub async fn open_queue(path: &Path) -> CliResult<PendingOperationQueue> {
    let store = open_journal(path)?;
    Ok(PendingOperationQueue::open(store, DEFAULT_MAX_RETRIES).await?)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use shelfsync_protocol::{EntityRef, OperationId, OperationKind};

    /// Creates a journal at `path` and returns its queue.
    pub async fn create_queue(path: &Path) -> PendingOperationQueue {
        let store = Arc::new(JournalQueueStore::open_file(path, JournalConfig::default()).unwrap());
        PendingOperationQueue::open(store, DEFAULT_MAX_RETRIES)
            .await
            .unwrap()
    }

    /// Queues a title edit of book `id`.
    pub async fn edit(queue: &PendingOperationQueue, id: &str, base: Option<u64>) -> OperationId {
        queue
            .enqueue(
                OperationKind::UpdateEntityFields,
                EntityRef::book(id),
                br#"{"fields":{"title":"T"}}"#.to_vec(),
                base,
            )
            .await
            .unwrap()
    }

    /// Claims every sendable row and fails `id` permanently.
    pub async fn fail(queue: &PendingOperationQueue, id: OperationId) {
        queue.next_batch(64).await.unwrap();
        queue.mark_failed(id, "HTTP 422: rejected", false).await.unwrap();
    }
}
