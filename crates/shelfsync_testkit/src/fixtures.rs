//! Library fixtures.
//!
//! Small constructors for the snapshots, payloads and stream records most
//! tests need.

use serde_json::{json, Value};
use shelfsync_protocol::{
    DomainEvent, EntityRef, EntitySnapshot, EventEnvelope, FieldMap, OperationPayload, Relation,
    RelationMember, UpdateFields,
};
use std::path::PathBuf;
use tempfile::TempDir;

/// A book snapshot with a title.
pub fn book(id: &str, version: u64, title: &str) -> EntitySnapshot {
    EntitySnapshot::new(EntityRef::book(id), version).with_field("title", json!(title))
}

/// A contributor snapshot with a name.
pub fn contributor(id: &str, version: u64, name: &str) -> EntitySnapshot {
    EntitySnapshot::new(EntityRef::contributor(id), version).with_field("name", json!(name))
}

/// A book credited to the given authors.
pub fn book_by(id: &str, version: u64, title: &str, authors: &[&str]) -> EntitySnapshot {
    book(id, version, title).with_relation(
        Relation::Authors,
        authors.iter().map(|a| RelationMember::new(*a)).collect(),
    )
}

/// Builds a field map.
pub fn fields(pairs: &[(&str, Value)]) -> FieldMap {
    pairs
        .iter()
        .map(|(name, value)| ((*name).to_string(), value.clone()))
        .collect()
}

/// An `UpdateEntityFields` payload.
pub fn field_patch(pairs: &[(&str, Value)]) -> OperationPayload {
    OperationPayload::UpdateFields(UpdateFields {
        fields: fields(pairs),
    })
}

/// An `UpdateEntityFields` payload setting the title.
pub fn title_patch(title: &str) -> OperationPayload {
    field_patch(&[("title", json!(title))])
}

/// The stream record a server would send for `event`, newline included.
pub fn record(event: &DomainEvent) -> String {
    let mut line = EventEnvelope::from_event(event).to_record();
    line.push('\n');
    line
}

/// Stream records for several events, concatenated.
pub fn records(events: &[DomainEvent]) -> String {
    events.iter().map(record).collect()
}

/// A temporary directory holding a queue journal.
///
/// The directory is removed when the value is dropped.
pub struct TempJournal {
    dir: TempDir,
}

impl TempJournal {
    /// Creates a fresh directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Path of the journal file; it does not exist until opened.
    pub fn path(&self) -> PathBuf {
        self.dir.path().join("queue.journal")
    }

    /// Size of the journal file, or 0 if it does not exist.
    pub fn size(&self) -> u64 {
        std::fs::metadata(self.path()).map(|m| m.len()).unwrap_or(0)
    }
}

impl Default for TempJournal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_one_line() {
        let line = record(&DomainEvent::EntityUpdated(book("b1", 2, "Dune")));
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.contains("\"book.updated\""));
    }

    #[test]
    fn book_by_credits_authors() {
        let snapshot = book_by("b1", 1, "Dune", &["c1", "c2"]);
        assert_eq!(snapshot.relations[&Relation::Authors].len(), 2);
    }

    #[test]
    fn temp_journal_starts_empty() {
        let journal = TempJournal::new();
        assert_eq!(journal.size(), 0);
        assert!(journal.path().ends_with("queue.journal"));
    }
}
