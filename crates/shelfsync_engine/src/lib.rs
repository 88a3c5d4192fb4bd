//! # ShelfSync Engine
//!
//! Offline-first synchronization engine for an audiobook library.
//!
//! This crate provides:
//! - A durable per-entity operation queue with coalescing
//! - Operation handlers for every mutation kind
//! - The push orchestrator with conflict detection and temporary-id
//!   reconciliation
//! - A live event stream client with reconnect backoff
//! - The event applier keeping the local store consistent with the stream
//! - `SyncEngine`, wiring all of the above
//!
//! ## Flow
//!
//! 1. An edit is applied to the local store and the entity turns `Pending`
//! 2. The edit is queued, folding into a pending row of the same kind
//! 3. A flush delivers queued rows, oldest first within each entity
//! 4. Confirmed rows are removed; the entity is `Synced` once none remain
//!
//! ## Key Invariants
//!
//! - A queued edit is never lost: it completes, waits, or fails visibly
//! - At most one operation per entity is in flight
//! - An edit made against an older server version than the cached one
//!   is never sent
//! - Remote endpoints are idempotent; delivery is at least once

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod backoff;
mod config;
mod engine;
mod error;
mod handler;
mod http;
mod locks;
mod orchestrator;
mod queue;
mod remote;
mod store;
mod stream;

pub use applier::{ApplyOutcome, EventApplier};
pub use backoff::Backoff;
pub use config::{BackoffConfig, JournalConfig, SyncConfig};
pub use engine::{EngineComponents, SyncEngine};
pub use error::{RemoteError, SyncError, SyncResult};
pub use handler::{
    CreateEntityHandler, DeleteEntityHandler, ExecuteOutcome, HandlerRegistry, IdMapping,
    MergeEntitiesHandler, OperationHandler, ReplaceRelationSetHandler, SplitAliasHandler,
    UpdateFieldsHandler,
};
pub use http::{HttpClient, HttpEventSource, HttpRemote, HttpResponse, ReqwestClient};
pub use locks::EntityLocks;
pub use orchestrator::{FlushReport, PushSyncOrchestrator, SyncNotice, SyncStats};
pub use queue::{
    compute_crc32, EnqueueOutcome, JournalQueueStore, JournalStats, MemoryQueueStore,
    PendingOperationQueue, QueueSnapshot, QueueStore, DEFAULT_MAX_RETRIES,
};
pub use remote::{
    collection_path, entity_path, HttpMethod, MockRemote, RemoteAck, RemoteRequest,
    RemoteService,
};
pub use store::{CachedEntity, EntityStore, MemoryEntityStore, SyncState, ALIASES_FIELD};
pub use stream::{
    ByteStream, ConnectionState, EventSource, EventStreamClient, ScriptedEventSource,
    ScriptedSession, SessionEnding, StreamStats, Subscription,
};
