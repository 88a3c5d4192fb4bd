//! # ShelfSync Storage
//!
//! Byte-store backends used to persist the pending-operation journal.
//!
//! Backends are **opaque byte stores**: they append, read back, flush and
//! replace bytes. Record framing, checksums and replay all live in the
//! engine's journal; a backend never interprets what it stores.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and ephemeral sessions
//! - [`FileBackend`] - For durable storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use shelfsync_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"queued").unwrap();
//! let data = backend.read_at(offset, 6).unwrap();
//! assert_eq!(&data, b"queued");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
