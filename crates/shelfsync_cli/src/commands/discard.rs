//! Discard command implementation.

use super::{open_queue, CliResult};
use shelfsync_protocol::OperationId;
use std::path::Path;

/// Drops a row from the queue.
///
/// The local cache is not touched; the owning app refreshes the entity on
/// its next start.
pub async fn run(path: &Path, id: u64) -> CliResult<()> {
    let queue = open_queue(path).await?;
    let row = queue.discard(OperationId(id)).await?;
    println!("Discarded {} {} on {}", row.id, row.kind, row.entity);
    Ok(())
}
