//! Dump-queue command implementation.

use super::{open_journal, CliResult};
use serde::Serialize;
use shelfsync_engine::QueueStore;
use std::path::Path;

/// Which rows to list and how much of each.
#[derive(Debug, Clone, Default)]
pub struct DumpOptions {
    /// Only list failed rows.
    pub failed_only: bool,
    /// Include the payload text.
    pub payloads: bool,
    /// Maximum rows to list.
    pub limit: Option<usize>,
}

/// A queued operation as printed.
#[derive(Debug, Serialize)]
pub struct DumpedOperation {
    /// Operation id.
    pub id: u64,
    /// Operation kind.
    pub kind: String,
    /// Target entity.
    pub entity: String,
    /// Status name.
    pub status: String,
    /// Failure reason, if failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Retryable failures so far.
    pub attempts: u32,
    /// Server version the edit was based on.
    pub base_version: Option<u64>,
    /// Enqueue time, RFC 3339.
    pub created_at: String,
    /// Payload text, if requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

/// Reads rows in queue order without changing any of them.
pub async fn collect(path: &Path, options: &DumpOptions) -> CliResult<Vec<DumpedOperation>> {
    let store = open_journal(path)?;
    let mut rows = store.load().await?.operations;
    rows.sort_by_key(|op| op.id);

    Ok(rows
        .into_iter()
        .filter(|op| !options.failed_only || op.is_failed())
        .take(options.limit.unwrap_or(usize::MAX))
        .map(|op| DumpedOperation {
            id: op.id.get(),
            kind: op.kind.to_string(),
            entity: op.entity.to_string(),
            status: op.status.name().to_string(),
            reason: op.failure_reason().map(str::to_string),
            attempts: op.attempt_count,
            base_version: op.base_version,
            created_at: op.created_at.to_rfc3339(),
            payload: options.payloads.then(|| op.payload_text()),
        })
        .collect())
}

/// Runs the dump-queue command.
pub async fn run(path: &Path, options: &DumpOptions, format: &str) -> CliResult<()> {
    let rows = collect(path, options).await?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&rows)?),
        _ => {
            if rows.is_empty() {
                println!("Queue is empty");
            }
            for row in &rows {
                print_text_row(row);
            }
        }
    }
    Ok(())
}

fn print_text_row(row: &DumpedOperation) {
    let base = row
        .base_version
        .map_or_else(|| "-".to_string(), |v| v.to_string());
    println!(
        "#{:<6} {:<10} {:<32} {:<28} base={} attempts={}",
        row.id, row.status, row.kind, row.entity, base, row.attempts
    );
    if let Some(reason) = &row.reason {
        println!("        reason: {reason}");
    }
    if let Some(payload) = &row.payload {
        println!("        payload: {payload}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::{create_queue, edit, fail};
    use shelfsync_testkit::TempJournal;

    #[tokio::test]
    async fn lists_rows_in_id_order() {
        let journal = TempJournal::new();
        {
            let queue = create_queue(&journal.path()).await;
            edit(&queue, "b2", Some(4)).await;
            edit(&queue, "b1", None).await;
        }

        let rows = collect(&journal.path(), &DumpOptions::default()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].entity, "book/b2");
        assert_eq!(rows[0].base_version, Some(4));
        assert_eq!(rows[1].entity, "book/b1");
        assert!(rows[0].id < rows[1].id);
        assert!(rows.iter().all(|row| row.payload.is_none()));
    }

    #[tokio::test]
    async fn failed_filter_and_payloads() {
        let journal = TempJournal::new();
        {
            let queue = create_queue(&journal.path()).await;
            let bad = edit(&queue, "b1", Some(1)).await;
            edit(&queue, "b2", Some(1)).await;
            fail(&queue, bad).await;
        }

        let options = DumpOptions {
            failed_only: true,
            payloads: true,
            limit: None,
        };
        let rows = collect(&journal.path(), &options).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "failed");
        assert_eq!(rows[0].reason.as_deref(), Some("HTTP 422: rejected"));
        assert!(rows[0].payload.as_deref().unwrap().contains("title"));
    }

    #[tokio::test]
    async fn limit_caps_output() {
        let journal = TempJournal::new();
        {
            let queue = create_queue(&journal.path()).await;
            for i in 0..5 {
                edit(&queue, &format!("b{i}"), None).await;
            }
        }
        let options = DumpOptions {
            limit: Some(2),
            ..DumpOptions::default()
        };
        assert_eq!(collect(&journal.path(), &options).await.unwrap().len(), 2);
    }
}
