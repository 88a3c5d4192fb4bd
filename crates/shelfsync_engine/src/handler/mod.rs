//! Operation handlers.
//!
//! One handler per [`HandlerKey`]. A handler owns everything kind-specific:
//! the payload encoding, the optimistic local mutation, the remote request,
//! and what to do once the server confirmed it.

mod entity;
mod identity;
mod relation;

pub use entity::{CreateEntityHandler, DeleteEntityHandler, UpdateFieldsHandler};
pub use identity::{MergeEntitiesHandler, SplitAliasHandler};
pub use relation::ReplaceRelationSetHandler;

pub(crate) use entity::apply_fields;

use crate::error::{RemoteError, SyncError, SyncResult};
use crate::remote::{RemoteAck, RemoteService};
use crate::store::EntityStore;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shelfsync_protocol::{
    DomainEvent, EntityId, EntityRef, EntityType, FieldMap, HandlerKey, OperationKind,
    OperationPayload, PendingOperation, ProtocolError,
};
use std::collections::HashMap;
use std::sync::Arc;

/// A temporary id the server replaced with a real one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdMapping {
    /// Type of the entity.
    pub entity_type: EntityType,
    /// The locally minted id.
    pub temporary: EntityId,
    /// The server-assigned id.
    pub assigned: EntityId,
}

/// What a successful remote execution tells the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecuteOutcome {
    /// Server version of the target after the call.
    pub server_version: Option<u64>,
    /// Temporary ids the server replaced.
    pub id_mappings: Vec<IdMapping>,
    /// Server-side corrections to the target's fields.
    pub field_corrections: FieldMap,
}

impl ExecuteOutcome {
    /// Builds an outcome from an ack, resolving which temporary ids it maps.
    ///
    /// `primary` is the operation's target; an `id` in the ack replaces it
    /// when it is temporary. Entries of `id_map` are typed by `lookup`.
    pub fn from_ack(
        primary: &EntityRef,
        ack: RemoteAck,
        lookup: impl Fn(&EntityId) -> Option<EntityType>,
    ) -> Self {
        let mut id_mappings = Vec::new();
        if let Some(assigned) = ack.id {
            if primary.id.is_temporary() && assigned != primary.id {
                id_mappings.push(IdMapping {
                    entity_type: primary.entity_type,
                    temporary: primary.id.clone(),
                    assigned,
                });
            }
        }
        for (temporary, assigned) in ack.id_map {
            if temporary == assigned || id_mappings.iter().any(|m| m.temporary == temporary) {
                continue;
            }
            if let Some(entity_type) = lookup(&temporary) {
                id_mappings.push(IdMapping {
                    entity_type,
                    temporary,
                    assigned,
                });
            }
        }
        Self {
            server_version: ack.version,
            id_mappings,
            field_corrections: ack.fields,
        }
    }

    /// Returns the id `id` ends up with after reconciliation.
    pub fn resolve(&self, id: &EntityId) -> EntityId {
        self.id_mappings
            .iter()
            .find(|m| &m.temporary == id)
            .map(|m| m.assigned.clone())
            .unwrap_or_else(|| id.clone())
    }
}

/// Kind-specific behavior of a queued operation.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Registry key of this handler.
    fn key(&self) -> HandlerKey;

    /// Whether edits of this kind fold into an existing pending row.
    fn coalesces(&self) -> bool {
        true
    }

    /// Combines the stored payload of a pending row with a newer edit of
    /// the same kind. The default keeps only the newer payload.
    fn coalesce(&self, _kind: OperationKind, _older: &[u8], newer: &[u8]) -> SyncResult<Vec<u8>> {
        Ok(newer.to_vec())
    }

    /// Encodes a payload as stored in the queue.
    fn serialize(&self, payload: &OperationPayload) -> SyncResult<Vec<u8>>;

    /// Decodes a stored payload.
    fn deserialize(&self, kind: OperationKind, bytes: &[u8]) -> SyncResult<OperationPayload>;

    /// Applies the edit to the local store before it is queued.
    fn apply_local(
        &self,
        entity: &EntityRef,
        payload: &OperationPayload,
        store: &dyn EntityStore,
    ) -> SyncResult<()>;

    /// Sends the operation to the remote service.
    async fn execute(
        &self,
        op: &PendingOperation,
        payload: &OperationPayload,
        remote: &dyn RemoteService,
    ) -> Result<ExecuteOutcome, RemoteError>;

    /// Re-applies the edit with authoritative ids once the server confirmed
    /// it. Must be idempotent.
    fn apply_confirmed(
        &self,
        _entity: &EntityRef,
        _payload: &OperationPayload,
        _outcome: &ExecuteOutcome,
        _store: &dyn EntityStore,
    ) -> SyncResult<()> {
        Ok(())
    }

    /// Rewrites ids inside a stored payload. Returns `None` if nothing
    /// referenced `from`.
    fn rewrite_payload(
        &self,
        kind: OperationKind,
        bytes: &[u8],
        from: &EntityId,
        to: &EntityId,
    ) -> SyncResult<Option<Vec<u8>>> {
        let mut payload = self.deserialize(kind, bytes)?;
        if payload.rewrite_id(from, to) {
            Ok(Some(self.serialize(&payload)?))
        } else {
            Ok(None)
        }
    }

    /// Whether `event` shows the server already holds what this operation
    /// would write.
    fn is_confirmed_by(&self, _payload: &OperationPayload, _event: &DomainEvent) -> bool {
        false
    }
}

/// Lookup table from [`HandlerKey`] to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<HandlerKey, Arc<dyn OperationHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in handler of every kind.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CreateEntityHandler));
        registry.register(Arc::new(UpdateFieldsHandler));
        registry.register(Arc::new(DeleteEntityHandler));
        registry.register(Arc::new(ReplaceRelationSetHandler));
        registry.register(Arc::new(MergeEntitiesHandler));
        registry.register(Arc::new(SplitAliasHandler));
        registry
    }

    /// Registers a handler, replacing any handler with the same key.
    pub fn register(&mut self, handler: Arc<dyn OperationHandler>) {
        self.handlers.insert(handler.key(), handler);
    }

    /// Returns the handler for a key.
    pub fn get(&self, key: HandlerKey) -> SyncResult<Arc<dyn OperationHandler>> {
        self.handlers
            .get(&key)
            .cloned()
            .ok_or(SyncError::NoHandler(key))
    }

    /// Returns the handler for an operation kind.
    pub fn for_kind(&self, kind: OperationKind) -> SyncResult<Arc<dyn OperationHandler>> {
        self.get(kind.handler_key())
    }

    /// Encodes a payload with its kind's handler.
    pub fn encode(&self, payload: &OperationPayload) -> SyncResult<Vec<u8>> {
        self.for_kind(payload.kind())?.serialize(payload)
    }

    /// Decodes a payload with its kind's handler.
    pub fn decode(&self, kind: OperationKind, bytes: &[u8]) -> SyncResult<OperationPayload> {
        self.for_kind(kind)?.deserialize(kind, bytes)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if no handlers are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.handlers.keys().collect();
        keys.sort();
        f.debug_struct("HandlerRegistry").field("handlers", &keys).finish()
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> SyncResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> SyncResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

pub(crate) fn mismatch(expected: HandlerKey, payload: &OperationPayload) -> SyncError {
    SyncError::Protocol(ProtocolError::PayloadMismatch {
        expected: expected.to_string(),
        actual: payload.kind().to_string(),
    })
}

pub(crate) fn kind_mismatch(expected: HandlerKey, kind: OperationKind) -> SyncError {
    SyncError::Protocol(ProtocolError::PayloadMismatch {
        expected: expected.to_string(),
        actual: kind.to_string(),
    })
}

pub(crate) fn invalid_request(err: SyncError) -> RemoteError {
    RemoteError::InvalidRequest(err.to_string())
}
