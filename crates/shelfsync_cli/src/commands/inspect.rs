//! Inspect command implementation.

use super::{open_journal, CliResult};
use serde::Serialize;
use shelfsync_engine::QueueStore;
use shelfsync_protocol::OperationStatus;
use std::collections::BTreeMap;
use std::path::Path;

/// Journal inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Journal path.
    pub path: String,
    /// Journal size in bytes.
    pub bytes: u64,
    /// Records in the journal, live or superseded.
    pub records: usize,
    /// Live queue rows.
    pub live: usize,
    /// Bytes of torn tail discarded on open.
    pub recovered_bytes: u64,
    /// Rows waiting to be sent.
    pub pending: usize,
    /// Rows left in flight by the last process.
    pub in_flight: usize,
    /// Rows stopped in failed.
    pub failed: usize,
    /// Row count per operation kind.
    pub by_kind: BTreeMap<String, usize>,
    /// Next operation id the queue will assign.
    pub next_id: u64,
}

/// Collects journal statistics without changing any row.
pub async fn inspect(path: &Path) -> CliResult<InspectResult> {
    let store = open_journal(path)?;
    let stats = store.stats()?;
    let snapshot = store.load().await?;

    let mut result = InspectResult {
        path: path.display().to_string(),
        bytes: stats.bytes,
        records: stats.records,
        live: stats.live,
        recovered_bytes: stats.recovered_bytes,
        pending: 0,
        in_flight: 0,
        failed: 0,
        by_kind: BTreeMap::new(),
        next_id: snapshot.next_id,
    };
    for op in &snapshot.operations {
        match op.status {
            OperationStatus::Pending => result.pending += 1,
            OperationStatus::InFlight => result.in_flight += 1,
            OperationStatus::Failed { .. } => result.failed += 1,
            OperationStatus::Completed => {}
        }
        *result.by_kind.entry(op.kind.to_string()).or_default() += 1;
    }
    Ok(result)
}

/// Runs the inspect command.
pub async fn run(path: &Path, format: &str) -> CliResult<()> {
    let result = inspect(path).await?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("Queue journal: {}", result.path);
    println!();
    println!("Journal:");
    println!("  Size:            {} bytes", result.bytes);
    println!("  Records:         {}", result.records);
    println!("  Live rows:       {}", result.live);
    if result.recovered_bytes > 0 {
        println!("  Torn tail:       {} bytes discarded", result.recovered_bytes);
    }
    println!("  Next id:         {}", result.next_id);
    println!();
    println!("Operations:");
    println!("  Pending:         {}", result.pending);
    println!("  In flight:       {}", result.in_flight);
    println!("  Failed:          {}", result.failed);
    if !result.by_kind.is_empty() {
        println!();
        println!("By kind:");
        for (kind, count) in &result.by_kind {
            println!("  {kind:<32} {count}");
        }
    }
}
