//! Retry command implementation.

use super::{open_queue, CliResult};
use shelfsync_protocol::OperationId;
use std::path::Path;

/// Returns a failed row to pending, optionally rebasing it.
pub async fn run(path: &Path, id: u64, base: Option<u64>) -> CliResult<()> {
    let queue = open_queue(path).await?;
    let id = OperationId(id);
    queue.retry(id, base).await?;
    match base {
        Some(base) => println!("Operation {id} queued for retry on base version {base}"),
        None => println!("Operation {id} queued for retry"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::{create_queue, edit, fail};
    use crate::commands::CliError;
    use shelfsync_engine::SyncError;
    use shelfsync_testkit::TempJournal;

    #[tokio::test]
    async fn failed_row_returns_to_pending() {
        let journal = TempJournal::new();
        let id = {
            let queue = create_queue(&journal.path()).await;
            let id = edit(&queue, "b1", Some(2)).await;
            fail(&queue, id).await;
            id
        };

        run(&journal.path(), id.get(), Some(7)).await.unwrap();

        let queue = create_queue(&journal.path()).await;
        let row = queue.get(id).unwrap();
        assert!(row.is_pending());
        assert_eq!(row.attempt_count, 0);
        assert_eq!(row.base_version, Some(7));
    }

    #[tokio::test]
    async fn pending_row_cannot_be_retried() {
        let journal = TempJournal::new();
        let id = {
            let queue = create_queue(&journal.path()).await;
            edit(&queue, "b1", None).await
        };
        let err = run(&journal.path(), id.get(), None).await.unwrap_err();
        assert!(matches!(err, CliError::Sync(SyncError::InvalidState { .. })));
    }
}
