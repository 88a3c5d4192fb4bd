//! Crash simulation for journal recovery tests.
//!
//! [`CrashableBackend`] is a shared in-memory byte store that can be told to
//! fail after a number of appended bytes, leaving a partial record behind,
//! exactly as a process killed mid-write would. Clones share the bytes, so
//! a test keeps one handle while the journal owns another, then reopens the
//! journal on [`CrashableBackend::restart`].
//!
//! ## Usage
//!
//! ```rust,ignore
//! let backend = CrashableBackend::new();
//! let store = JournalQueueStore::open(backend.clone(), JournalConfig::default())?;
//! backend.crash_after(10);
//! // ... enqueue fails mid-record ...
//! let reopened = JournalQueueStore::open(backend.restart(), JournalConfig::default())?;
//! ```

use parking_lot::Mutex;
use shelfsync_storage::{InMemoryBackend, StorageBackend, StorageError, StorageResult};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct CrashState {
    data: Mutex<Vec<u8>>,
    crash_after_bytes: AtomicUsize,
    bytes_written: AtomicUsize,
    crashed: AtomicBool,
    fail_on_flush: AtomicBool,
}

/// A storage backend that can simulate crashes.
#[derive(Debug, Clone)]
pub struct CrashableBackend {
    state: Arc<CrashState>,
}

impl CrashableBackend {
    /// Creates an empty backend that never crashes until told to.
    pub fn new() -> Self {
        Self {
            state: Arc::new(CrashState {
                data: Mutex::new(Vec::new()),
                crash_after_bytes: AtomicUsize::new(usize::MAX),
                bytes_written: AtomicUsize::new(0),
                crashed: AtomicBool::new(false),
                fail_on_flush: AtomicBool::new(false),
            }),
        }
    }

    /// Crashes once `bytes` more bytes have been appended.
    pub fn crash_after(&self, bytes: usize) {
        self.state.bytes_written.store(0, Ordering::SeqCst);
        self.state.crash_after_bytes.store(bytes, Ordering::SeqCst);
    }

    /// Sets whether flush should fail.
    pub fn set_fail_on_flush(&self, fail: bool) {
        self.state.fail_on_flush.store(fail, Ordering::SeqCst);
    }

    /// Returns whether the backend has crashed.
    pub fn has_crashed(&self) -> bool {
        self.state.crashed.load(Ordering::SeqCst)
    }

    /// Returns a copy of the stored bytes.
    pub fn data(&self) -> Vec<u8> {
        self.state.data.lock().clone()
    }

    /// Returns a fresh backend holding the bytes that survived, as seen by
    /// the next process.
    pub fn restart(&self) -> InMemoryBackend {
        InMemoryBackend::with_data(self.data())
    }

    fn crash(&self, what: &str) -> StorageError {
        self.state.crashed.store(true, Ordering::SeqCst);
        StorageError::Io(io::Error::other(format!("simulated crash during {what}")))
    }
}

impl Default for CrashableBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let data = self.state.data.lock();
        let start = offset as usize;
        let end = start.saturating_add(len);
        if end > data.len() {
            return Err(StorageError::ReadPastEnd {
                offset,
                len,
                size: data.len() as u64,
            });
        }
        Ok(data[start..end].to_vec())
    }

    fn append(&mut self, bytes: &[u8]) -> StorageResult<u64> {
        if self.has_crashed() {
            return Err(self.crash("write after crash"));
        }
        let current = self.state.bytes_written.fetch_add(bytes.len(), Ordering::SeqCst);
        let threshold = self.state.crash_after_bytes.load(Ordering::SeqCst);
        let mut data = self.state.data.lock();
        let offset = data.len() as u64;

        if current + bytes.len() > threshold {
            let partial = threshold.saturating_sub(current);
            data.extend_from_slice(&bytes[..partial]);
            drop(data);
            return Err(self.crash("partial write"));
        }
        data.extend_from_slice(bytes);
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.state.fail_on_flush.load(Ordering::SeqCst) {
            return Err(self.crash("flush"));
        }
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.state.data.lock().len() as u64)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut data = self.state.data.lock();
        let size = data.len() as u64;
        if new_size > size {
            return Err(StorageError::TruncatePastEnd {
                requested: new_size,
                size,
            });
        }
        data.truncate(new_size as usize);
        Ok(())
    }

    fn replace_contents(&mut self, bytes: &[u8]) -> StorageResult<()> {
        if self.has_crashed() {
            return Err(self.crash("replace after crash"));
        }
        *self.state.data.lock() = bytes.to_vec();
        Ok(())
    }
}

/// Cuts `bytes` off the end of a file, as a crash mid-append would.
pub fn tear_tail(path: impl AsRef<Path>, bytes: u64) -> io::Result<()> {
    let file = OpenOptions::new().write(true).open(path)?;
    let len = file.metadata()?.len();
    file.set_len(len.saturating_sub(bytes))?;
    file.sync_all()
}

/// Appends arbitrary bytes to a file.
pub fn append_garbage(path: impl AsRef<Path>, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_leaves_partial_write() {
        let backend = CrashableBackend::new();
        let mut writer = backend.clone();
        writer.append(b"first").unwrap();
        backend.crash_after(3);

        assert!(writer.append(b"second").is_err());
        assert!(backend.has_crashed());
        assert_eq!(backend.data(), b"firstsec");
        assert!(writer.append(b"more").is_err());

        let restarted = backend.restart();
        assert_eq!(restarted.size().unwrap(), 8);
    }

    #[test]
    fn tear_tail_shrinks_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("j");
        std::fs::write(&path, b"0123456789").unwrap();
        tear_tail(&path, 4).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"012345");
        append_garbage(&path, b"zz").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"012345zz");
    }
}
