//! Append-only operation journal.
//!
//! ## Record Format
//!
//! ```text
//! | len (u32 LE) | crc32 (u32 LE) | CBOR record (len bytes) |
//! ```
//!
//! Records are upserts, removals or a watermark written at the head of a
//! compacted journal. Every record carries a revision, so replay keeps the
//! newest state of each row regardless of write order.
//!
//! ## Recovery
//!
//! Replay stops at the first record that is short, fails its checksum or
//! does not decode. Everything from that point on is a torn write from a
//! crash and is truncated away.

use super::index::RowIndex;
use super::{QueueSnapshot, QueueStore};
use crate::config::JournalConfig;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shelfsync_protocol::{OperationId, PendingOperation};
use shelfsync_storage::{FileBackend, StorageBackend};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Size of the length and checksum prefix of each record.
const RECORD_HEADER_LEN: usize = 8;

#[derive(Debug, Serialize, Deserialize)]
enum JournalRecord {
    Put(PendingOperation),
    Remove { id: OperationId, revision: u64 },
    Watermark { next_id: u64, next_revision: u64 },
}

/// Counters describing a journal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalStats {
    /// Records currently in the journal.
    pub records: usize,
    /// Rows still live.
    pub live: usize,
    /// Journal size in bytes.
    pub bytes: u64,
    /// Bytes of torn tail discarded when the journal was opened.
    pub recovered_bytes: u64,
    /// Compactions since the journal was opened.
    pub compactions: u64,
}

struct Journal<B> {
    backend: B,
    index: RowIndex,
    records: usize,
    config: JournalConfig,
    recovered_bytes: u64,
    compactions: u64,
}

impl<B: StorageBackend> Journal<B> {
    fn open(mut backend: B, config: JournalConfig) -> SyncResult<Self> {
        let data = backend.read_all()?;
        let mut index = RowIndex::new();
        let mut records = 0;
        let mut offset = 0usize;

        while let Some((record, next)) = decode_at(&data, offset) {
            match record {
                JournalRecord::Put(op) => {
                    index.apply_put(op);
                }
                JournalRecord::Remove { id, revision } => {
                    index.apply_remove(id, revision);
                }
                JournalRecord::Watermark {
                    next_id,
                    next_revision,
                } => index.apply_watermark(next_id, next_revision),
            }
            records += 1;
            offset = next;
        }

        let recovered_bytes = (data.len() - offset) as u64;
        if recovered_bytes > 0 {
            warn!(
                offset,
                discarded = recovered_bytes,
                "truncating torn tail of operation journal"
            );
            backend.truncate(offset as u64)?;
            backend.flush()?;
        }
        debug!(records, live = index.live(), "operation journal replayed");

        Ok(Self {
            backend,
            index,
            records,
            config,
            recovered_bytes,
            compactions: 0,
        })
    }

    fn put(&mut self, op: PendingOperation) -> SyncResult<()> {
        if !self.index.apply_put(op.clone()) {
            debug!(id = %op.id, revision = op.revision, "skipping stale journal write");
            return Ok(());
        }
        self.append(&JournalRecord::Put(op))
    }

    fn remove(&mut self, id: OperationId, revision: u64) -> SyncResult<()> {
        if !self.index.apply_remove(id, revision) {
            return Ok(());
        }
        self.append(&JournalRecord::Remove { id, revision })
    }

    fn append(&mut self, record: &JournalRecord) -> SyncResult<()> {
        let framed = encode_record(record)?;
        self.backend.append(&framed)?;
        self.backend.flush()?;
        self.records += 1;

        if self.config.should_compact(self.records, self.index.live()) {
            self.compact()?;
        }
        Ok(())
    }

    fn compact(&mut self) -> SyncResult<()> {
        let mut buf = encode_record(&JournalRecord::Watermark {
            next_id: self.index.next_id(),
            next_revision: self.index.next_revision(),
        })?;
        for op in self.index.rows() {
            buf.extend_from_slice(&encode_record(&JournalRecord::Put(op.clone()))?);
        }

        let before = self.records;
        self.backend.replace_contents(&buf)?;
        self.records = self.index.live() + 1;
        self.compactions += 1;
        info!(
            before,
            after = self.records,
            bytes = buf.len(),
            "compacted operation journal"
        );
        Ok(())
    }

    fn stats(&self) -> SyncResult<JournalStats> {
        Ok(JournalStats {
            records: self.records,
            live: self.index.live(),
            bytes: self.backend.size()?,
            recovered_bytes: self.recovered_bytes,
            compactions: self.compactions,
        })
    }
}

fn encode_record(record: &JournalRecord) -> SyncResult<Vec<u8>> {
    let mut body = Vec::new();
    ciborium::into_writer(record, &mut body).map_err(|e| SyncError::Codec(e.to_string()))?;
    let len = u32::try_from(body.len())
        .map_err(|_| SyncError::Codec(format!("record of {} bytes is too large", body.len())))?;

    let mut framed = Vec::with_capacity(RECORD_HEADER_LEN + body.len());
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(&compute_crc32(&body).to_le_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Decodes the record at `offset`, returning it with the next offset.
fn decode_at(data: &[u8], offset: usize) -> Option<(JournalRecord, usize)> {
    let header = data.get(offset..offset.checked_add(RECORD_HEADER_LEN)?)?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

    let start = offset + RECORD_HEADER_LEN;
    let body = data.get(start..start.checked_add(len)?)?;
    if compute_crc32(body) != crc {
        warn!(offset, "journal record checksum mismatch");
        return None;
    }
    match ciborium::from_reader::<JournalRecord, _>(body) {
        Ok(record) => Some((record, start + len)),
        Err(e) => {
            warn!(offset, error = %e, "undecodable journal record");
            None
        }
    }
}

/// CRC32 (IEEE polynomial) of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    !data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize]
    })
}

/// A [`QueueStore`] persisting rows to an append-only journal.
///
/// Backend I/O runs on the blocking thread pool.
pub struct JournalQueueStore<B: StorageBackend + 'static> {
    inner: Arc<Mutex<Journal<B>>>,
}

impl<B: StorageBackend + 'static> JournalQueueStore<B> {
    /// Opens a journal, replaying and repairing whatever the backend holds.
    pub fn open(backend: B, config: JournalConfig) -> SyncResult<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(Journal::open(backend, config)?)),
        })
    }

    /// Returns journal counters.
    pub fn stats(&self) -> SyncResult<JournalStats> {
        self.inner.lock().stats()
    }

    /// Rewrites the journal to hold only live rows.
    pub fn compact(&self) -> SyncResult<()> {
        self.inner.lock().compact()
    }

    async fn run<T, F>(&self, f: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Journal<B>) -> SyncResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&mut *inner.lock()))
            .await
            .map_err(|e| SyncError::TaskFailed(e.to_string()))?
    }
}

impl JournalQueueStore<FileBackend> {
    /// Opens or creates a journal file.
    pub fn open_file(path: impl AsRef<Path>, config: JournalConfig) -> SyncResult<Self> {
        Self::open(FileBackend::open_with_create_dirs(path.as_ref())?, config)
    }
}

#[async_trait]
impl<B: StorageBackend + 'static> QueueStore for JournalQueueStore<B> {
    async fn load(&self) -> SyncResult<QueueSnapshot> {
        Ok(self.inner.lock().index.snapshot())
    }

    async fn put(&self, op: PendingOperation) -> SyncResult<()> {
        self.run(move |journal| journal.put(op)).await
    }

    async fn remove(&self, id: OperationId, revision: u64) -> SyncResult<()> {
        self.run(move |journal| journal.remove(id, revision)).await
    }
}
