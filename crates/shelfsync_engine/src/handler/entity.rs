//! Create, field update and delete handlers.

use super::{
    decode, encode, invalid_request, kind_mismatch, mismatch, ExecuteOutcome, OperationHandler,
};
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::remote::{collection_path, entity_path, HttpMethod, RemoteRequest, RemoteService};
use crate::store::{CachedEntity, EntityStore, SyncState};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use shelfsync_protocol::{
    CreateEntity, DomainEvent, EntityId, EntityRef, EntitySnapshot, EntityType, FieldMap,
    HandlerKey, OperationKind, OperationPayload, PendingOperation, UpdateFields,
};

/// Merges a field patch into `fields`. `null` clears a field.
pub(crate) fn apply_fields(fields: &mut FieldMap, patch: &FieldMap) {
    for (name, value) in patch {
        if value.is_null() {
            fields.remove(name);
        } else {
            fields.insert(name.clone(), value.clone());
        }
    }
}

/// Returns true if `snapshot` already carries every value of `patch`.
pub(crate) fn snapshot_has_fields(snapshot: &EntitySnapshot, patch: &FieldMap) -> bool {
    patch.iter().all(|(name, value)| match snapshot.fields.get(name) {
        Some(current) => current == value,
        None => value.is_null(),
    })
}

/// Handles [`OperationKind::CreateEntity`]: `POST /{collection}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CreateEntityHandler;

impl CreateEntityHandler {
    fn payload(payload: &OperationPayload) -> SyncResult<&CreateEntity> {
        match payload {
            OperationPayload::Create(p) => Ok(p),
            other => Err(mismatch(HandlerKey::CreateEntity, other)),
        }
    }
}

#[async_trait]
impl OperationHandler for CreateEntityHandler {
    fn key(&self) -> HandlerKey {
        HandlerKey::CreateEntity
    }

    fn serialize(&self, payload: &OperationPayload) -> SyncResult<Vec<u8>> {
        encode(Self::payload(payload)?)
    }

    fn deserialize(&self, kind: OperationKind, bytes: &[u8]) -> SyncResult<OperationPayload> {
        if kind != OperationKind::CreateEntity {
            return Err(kind_mismatch(self.key(), kind));
        }
        Ok(OperationPayload::Create(decode(bytes)?))
    }

    fn apply_local(
        &self,
        entity: &EntityRef,
        payload: &OperationPayload,
        store: &dyn EntityStore,
    ) -> SyncResult<()> {
        let create = Self::payload(payload)?;
        // A coalesced create edits the row the first create inserted.
        let mut row = store
            .get(entity)?
            .unwrap_or_else(|| CachedEntity::local(entity.clone()));
        apply_fields(&mut row.fields, &create.fields);
        for (relation, members) in &create.relations {
            row.relations.insert(*relation, members.clone());
        }
        row.sync_state = SyncState::Pending;
        row.last_modified = Utc::now();
        store.upsert(row)
    }

    async fn execute(
        &self,
        op: &PendingOperation,
        payload: &OperationPayload,
        remote: &dyn RemoteService,
    ) -> Result<ExecuteOutcome, RemoteError> {
        let create = Self::payload(payload).map_err(invalid_request)?;
        let request = RemoteRequest::new(
            HttpMethod::Post,
            collection_path(op.entity.entity_type),
            Some(json!({
                "id": op.entity.id,
                "fields": create.fields,
                "relations": create.relations,
            })),
        );
        let ack = remote.send(request).await?;
        Ok(ExecuteOutcome::from_ack(&op.entity, ack, |id| {
            member_type_of(create, id)
        }))
    }

    fn is_confirmed_by(&self, payload: &OperationPayload, event: &DomainEvent) -> bool {
        let Ok(create) = Self::payload(payload) else {
            return false;
        };
        match event {
            DomainEvent::EntityCreated(s) | DomainEvent::EntityUpdated(s) => {
                snapshot_has_fields(s, &create.fields)
                    && create
                        .relations
                        .iter()
                        .all(|(relation, members)| s.relations.get(relation) == Some(members))
            }
            _ => false,
        }
    }
}

fn member_type_of(create: &CreateEntity, id: &EntityId) -> Option<EntityType> {
    create
        .relations
        .iter()
        .find(|(_, members)| members.iter().any(|m| &m.id == id))
        .map(|(relation, _)| relation.member_type())
}

/// Handles [`OperationKind::UpdateEntityFields`]: `PATCH /{collection}/{id}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UpdateFieldsHandler;

impl UpdateFieldsHandler {
    fn payload(payload: &OperationPayload) -> SyncResult<&UpdateFields> {
        match payload {
            OperationPayload::UpdateFields(p) => Ok(p),
            other => Err(mismatch(HandlerKey::UpdateEntityFields, other)),
        }
    }
}

#[async_trait]
impl OperationHandler for UpdateFieldsHandler {
    fn key(&self) -> HandlerKey {
        HandlerKey::UpdateEntityFields
    }

    fn serialize(&self, payload: &OperationPayload) -> SyncResult<Vec<u8>> {
        encode(Self::payload(payload)?)
    }

    fn deserialize(&self, kind: OperationKind, bytes: &[u8]) -> SyncResult<OperationPayload> {
        if kind != OperationKind::UpdateEntityFields {
            return Err(kind_mismatch(self.key(), kind));
        }
        Ok(OperationPayload::UpdateFields(decode(bytes)?))
    }

    /// Newer values win per field; fields only the older patch names are
    /// kept, and nulls stay in place so they still clear on the server.
    fn coalesce(&self, kind: OperationKind, older: &[u8], newer: &[u8]) -> SyncResult<Vec<u8>> {
        if kind != OperationKind::UpdateEntityFields {
            return Err(kind_mismatch(self.key(), kind));
        }
        let mut merged: UpdateFields = decode(older)?;
        let newer: UpdateFields = decode(newer)?;
        merged.fields.extend(newer.fields);
        encode(&merged)
    }

    fn apply_local(
        &self,
        entity: &EntityRef,
        payload: &OperationPayload,
        store: &dyn EntityStore,
    ) -> SyncResult<()> {
        let update = Self::payload(payload)?;
        let found = store.modify(entity, &mut |row| {
            apply_fields(&mut row.fields, &update.fields);
            row.sync_state = SyncState::Pending;
            row.last_modified = Utc::now();
        })?;
        if !found {
            return Err(SyncError::EntityNotFound(entity.clone()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        op: &PendingOperation,
        payload: &OperationPayload,
        remote: &dyn RemoteService,
    ) -> Result<ExecuteOutcome, RemoteError> {
        let update = Self::payload(payload).map_err(invalid_request)?;
        let request = RemoteRequest::new(
            HttpMethod::Patch,
            entity_path(&op.entity),
            Some(json!({
                "fields": update.fields,
                "base_version": op.base_version,
            })),
        );
        let ack = remote.send(request).await?;
        Ok(ExecuteOutcome::from_ack(&op.entity, ack, |_| None))
    }

    fn is_confirmed_by(&self, payload: &OperationPayload, event: &DomainEvent) -> bool {
        match (Self::payload(payload), event) {
            (Ok(update), DomainEvent::EntityCreated(s) | DomainEvent::EntityUpdated(s)) => {
                snapshot_has_fields(s, &update.fields)
            }
            _ => false,
        }
    }
}

/// Handles [`OperationKind::DeleteEntity`]: `DELETE /{collection}/{id}`.
///
/// The local row is tombstoned until the server confirms, then removed
/// together with every reference to it.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeleteEntityHandler;

#[async_trait]
impl OperationHandler for DeleteEntityHandler {
    fn key(&self) -> HandlerKey {
        HandlerKey::DeleteEntity
    }

    fn serialize(&self, payload: &OperationPayload) -> SyncResult<Vec<u8>> {
        match payload {
            OperationPayload::Delete => Ok(b"{}".to_vec()),
            other => Err(mismatch(self.key(), other)),
        }
    }

    fn deserialize(&self, kind: OperationKind, _bytes: &[u8]) -> SyncResult<OperationPayload> {
        if kind != OperationKind::DeleteEntity {
            return Err(kind_mismatch(self.key(), kind));
        }
        Ok(OperationPayload::Delete)
    }

    fn apply_local(
        &self,
        entity: &EntityRef,
        _payload: &OperationPayload,
        store: &dyn EntityStore,
    ) -> SyncResult<()> {
        let found = store.modify(entity, &mut |row| {
            row.tombstoned = true;
            row.sync_state = SyncState::Pending;
            row.last_modified = Utc::now();
        })?;
        if !found {
            return Err(SyncError::EntityNotFound(entity.clone()));
        }
        Ok(())
    }

    async fn execute(
        &self,
        op: &PendingOperation,
        _payload: &OperationPayload,
        remote: &dyn RemoteService,
    ) -> Result<ExecuteOutcome, RemoteError> {
        let request = RemoteRequest::new(HttpMethod::Delete, entity_path(&op.entity), None);
        match remote.send(request).await {
            Ok(ack) => Ok(ExecuteOutcome::from_ack(&op.entity, ack, |_| None)),
            // Already gone: the delete happened, possibly from a lost response.
            Err(e) if e.status() == Some(404) => Ok(ExecuteOutcome::default()),
            Err(e) => Err(e),
        }
    }

    fn apply_confirmed(
        &self,
        entity: &EntityRef,
        _payload: &OperationPayload,
        _outcome: &ExecuteOutcome,
        store: &dyn EntityStore,
    ) -> SyncResult<()> {
        store.delete(entity)?;
        store.remove_references(entity.entity_type, &entity.id)?;
        Ok(())
    }

    fn is_confirmed_by(&self, _payload: &OperationPayload, event: &DomainEvent) -> bool {
        matches!(event, DomainEvent::EntityDeleted { .. })
    }
}
