//! # ShelfSync Testkit
//!
//! Test utilities for ShelfSync.
//!
//! This crate provides:
//! - Library fixtures (books, contributors, field patches, stream records)
//! - Temporary journal locations
//! - Property-based test generators using proptest
//! - A storage backend that simulates crashes mid-write
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shelfsync_testkit::prelude::*;
//!
//! let snapshot = book("b1", 3, "Dune");
//! let line = record(&DomainEvent::EntityUpdated(snapshot));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use crash::*;
pub use fixtures::*;
pub use generators::*;
