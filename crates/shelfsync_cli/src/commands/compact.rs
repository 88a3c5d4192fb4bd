//! Compact command implementation.

use super::{open_journal, CliResult};
use std::path::Path;

/// Compaction statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactStats {
    /// Records before compaction.
    pub records_before: usize,
    /// Records after compaction.
    pub records_after: usize,
    /// Bytes before compaction.
    pub bytes_before: u64,
    /// Bytes after compaction.
    pub bytes_after: u64,
}

/// Compacts the journal unless `dry_run` is set.
pub fn compact(path: &Path, dry_run: bool) -> CliResult<CompactStats> {
    let store = open_journal(path)?;
    let before = store.stats()?;
    if dry_run {
        return Ok(CompactStats {
            records_before: before.records,
            // A watermark record plus one record per live row.
            records_after: before.live + 1,
            bytes_before: before.bytes,
            bytes_after: before.bytes,
        });
    }

    store.compact()?;
    let after = store.stats()?;
    Ok(CompactStats {
        records_before: before.records,
        records_after: after.records,
        bytes_before: before.bytes,
        bytes_after: after.bytes,
    })
}

/// Runs the compact command.
pub fn run(path: &Path, dry_run: bool) -> CliResult<()> {
    println!("Compacting queue journal at {:?}", path);
    if dry_run {
        println!("(dry run - no changes will be made)");
    }
    println!();

    let stats = compact(path, dry_run)?;
    println!("  Records before: {}", stats.records_before);
    println!("  Records after:  {}", stats.records_after);
    if !dry_run {
        println!("  Size before:    {} bytes", stats.bytes_before);
        println!("  Size after:     {} bytes", stats.bytes_after);
        println!(
            "  Space saved:    {} bytes",
            stats.bytes_before.saturating_sub(stats.bytes_after)
        );
    }
    Ok(())
}
