//! # ShelfSync Protocol
//!
//! Wire types and domain vocabulary shared by the sync engine and its
//! tooling.
//!
//! This crate provides:
//! - Entity identifiers, references and relation members
//! - `OperationKind`, typed `OperationPayload`s and `PendingOperation` rows
//! - `EventEnvelope` and the `EventDecoder` producing `DomainEvent`s
//! - `RecordFramer` for newline-delimited event streams
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod entity;
mod error;
mod event;
mod framing;
mod operation;

pub use entity::{
    EntityId, EntityRef, EntitySnapshot, EntityType, FieldMap, Relation, RelationMember,
    TEMPORARY_ID_PREFIX,
};
pub use error::{ProtocolError, ProtocolResult};
pub use event::{DomainEvent, EventDecoder, EventEnvelope, HEARTBEAT_TAG};
pub use framing::{RecordFramer, DEFAULT_MAX_RECORD_LEN};
pub use operation::{
    CreateEntity, HandlerKey, MergeEntities, OperationId, OperationKind, OperationPayload,
    OperationStatus, PendingOperation, ReplaceRelationSet, SplitAlias, UpdateFields,
};
