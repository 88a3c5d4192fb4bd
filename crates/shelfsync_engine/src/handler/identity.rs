//! Identity-changing handlers: merging duplicates and splitting aliases.
//!
//! Both re-link dependent relations twice. Once optimistically when the
//! edit is made, using whatever ids exist locally, and once after the
//! server confirmed, using the authoritative ids from the outcome. The
//! second pass is idempotent: when temporary ids were already rewritten
//! it finds nothing left to move.

use super::{
    decode, encode, invalid_request, kind_mismatch, mismatch, ExecuteOutcome, OperationHandler,
};
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::remote::{entity_path, HttpMethod, RemoteRequest, RemoteService};
use crate::store::{CachedEntity, EntityStore, SyncState};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use shelfsync_protocol::{
    DomainEvent, EntityId, EntityRef, EntityType, HandlerKey, MergeEntities, OperationKind,
    OperationPayload, PendingOperation, SplitAlias,
};

/// Handles [`OperationKind::MergeEntities`]:
/// `POST /{collection}/{target}/merge`.
///
/// The operation targets the surviving entity. Merges never coalesce.
#[derive(Debug, Default, Clone, Copy)]
pub struct MergeEntitiesHandler;

impl MergeEntitiesHandler {
    fn payload(payload: &OperationPayload) -> SyncResult<&MergeEntities> {
        match payload {
            OperationPayload::Merge(p) => Ok(p),
            other => Err(mismatch(HandlerKey::MergeEntities, other)),
        }
    }

    fn fold(
        store: &dyn EntityStore,
        entity_type: EntityType,
        source: &EntityId,
        target: &EntityId,
        alias: Option<&str>,
    ) -> SyncResult<usize> {
        let moved = store.rewrite_references(entity_type, source, target)?;
        if let Some(alias) = alias {
            store.modify(&EntityRef::new(entity_type, target.clone()), &mut |row| {
                row.add_alias(alias);
            })?;
        }
        Ok(moved)
    }
}

#[async_trait]
impl OperationHandler for MergeEntitiesHandler {
    fn key(&self) -> HandlerKey {
        HandlerKey::MergeEntities
    }

    fn coalesces(&self) -> bool {
        false
    }

    fn serialize(&self, payload: &OperationPayload) -> SyncResult<Vec<u8>> {
        encode(Self::payload(payload)?)
    }

    fn deserialize(&self, kind: OperationKind, bytes: &[u8]) -> SyncResult<OperationPayload> {
        if kind != OperationKind::MergeEntities {
            return Err(kind_mismatch(self.key(), kind));
        }
        Ok(OperationPayload::Merge(decode(bytes)?))
    }

    fn apply_local(
        &self,
        entity: &EntityRef,
        payload: &OperationPayload,
        store: &dyn EntityStore,
    ) -> SyncResult<()> {
        let merge = Self::payload(payload)?;
        if merge.source.entity_type != merge.target.entity_type {
            return Err(SyncError::Payload(format!(
                "cannot merge {} into {}",
                merge.source, merge.target
            )));
        }
        if merge.source == merge.target {
            return Err(SyncError::Payload(format!(
                "cannot merge {} into itself",
                merge.source
            )));
        }
        if store.get(&merge.target)?.is_none() {
            return Err(SyncError::EntityNotFound(merge.target.clone()));
        }
        if store.get(&merge.source)?.is_none() {
            return Err(SyncError::EntityNotFound(merge.source.clone()));
        }

        Self::fold(
            store,
            merge.target.entity_type,
            &merge.source.id,
            &merge.target.id,
            merge.source_name.as_deref(),
        )?;
        store.modify(entity, &mut |row| {
            row.sync_state = SyncState::Pending;
            row.last_modified = Utc::now();
        })?;
        Ok(())
    }

    async fn execute(
        &self,
        op: &PendingOperation,
        payload: &OperationPayload,
        remote: &dyn RemoteService,
    ) -> Result<ExecuteOutcome, RemoteError> {
        let merge = Self::payload(payload).map_err(invalid_request)?;
        let request = RemoteRequest::new(
            HttpMethod::Post,
            format!("{}/merge", entity_path(&merge.target)),
            Some(json!({
                "source_id": merge.source.id,
                "source_name": merge.source_name,
            })),
        );
        let ack = remote.send(request).await?;
        let entity_type = merge.target.entity_type;
        Ok(ExecuteOutcome::from_ack(&op.entity, ack, |id| {
            (id == &merge.source.id || id == &merge.target.id).then_some(entity_type)
        }))
    }

    fn apply_confirmed(
        &self,
        _entity: &EntityRef,
        payload: &OperationPayload,
        outcome: &ExecuteOutcome,
        store: &dyn EntityStore,
    ) -> SyncResult<()> {
        let merge = Self::payload(payload)?;
        let source = outcome.resolve(&merge.source.id);
        let target = outcome.resolve(&merge.target.id);
        Self::fold(
            store,
            merge.target.entity_type,
            &source,
            &target,
            merge.source_name.as_deref(),
        )?;
        Ok(())
    }

    fn is_confirmed_by(&self, payload: &OperationPayload, event: &DomainEvent) -> bool {
        match (Self::payload(payload), event) {
            (Ok(merge), DomainEvent::EntitiesMerged { source, target, .. }) => {
                source == &merge.source && target == &merge.target
            }
            _ => false,
        }
    }
}

/// Handles [`OperationKind::SplitAliasFromEntity`]:
/// `POST /contributors/{id}/split`.
///
/// The operation targets the original contributor. The alias becomes a
/// new contributor and the listed books credit it instead of the original.
#[derive(Debug, Default, Clone, Copy)]
pub struct SplitAliasHandler;

impl SplitAliasHandler {
    fn payload(payload: &OperationPayload) -> SyncResult<&SplitAlias> {
        match payload {
            OperationPayload::SplitAlias(p) => Ok(p),
            other => Err(mismatch(HandlerKey::SplitAliasFromEntity, other)),
        }
    }

    fn move_credits(
        store: &dyn EntityStore,
        owners: impl IntoIterator<Item = EntityId>,
        from: &EntityId,
        to: &EntityId,
    ) -> SyncResult<()> {
        for owner in owners {
            store.modify(&EntityRef::book(owner), &mut |book| {
                book.relink(EntityType::Contributor, from, to);
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl OperationHandler for SplitAliasHandler {
    fn key(&self) -> HandlerKey {
        HandlerKey::SplitAliasFromEntity
    }

    fn coalesces(&self) -> bool {
        false
    }

    fn serialize(&self, payload: &OperationPayload) -> SyncResult<Vec<u8>> {
        encode(Self::payload(payload)?)
    }

    fn deserialize(&self, kind: OperationKind, bytes: &[u8]) -> SyncResult<OperationPayload> {
        if kind != OperationKind::SplitAliasFromEntity {
            return Err(kind_mismatch(self.key(), kind));
        }
        Ok(OperationPayload::SplitAlias(decode(bytes)?))
    }

    fn apply_local(
        &self,
        entity: &EntityRef,
        payload: &OperationPayload,
        store: &dyn EntityStore,
    ) -> SyncResult<()> {
        let split = Self::payload(payload)?;
        if entity.entity_type != EntityType::Contributor {
            return Err(SyncError::Payload(format!(
                "aliases can only be split from contributors, not {entity}"
            )));
        }
        let found = store.modify(entity, &mut |original| {
            original.remove_alias(&split.alias);
            original.sync_state = SyncState::Pending;
            original.last_modified = Utc::now();
        })?;
        if !found {
            return Err(SyncError::EntityNotFound(entity.clone()));
        }

        let new_ref = EntityRef::contributor(split.new_id.clone());
        if store.get(&new_ref)?.is_none() {
            let mut created = CachedEntity::local(new_ref);
            created.fields.insert("name".into(), json!(split.alias));
            store.upsert(created)?;
        }
        Self::move_credits(
            store,
            split.relation_owners.iter().cloned(),
            &entity.id,
            &split.new_id,
        )
    }

    async fn execute(
        &self,
        op: &PendingOperation,
        payload: &OperationPayload,
        remote: &dyn RemoteService,
    ) -> Result<ExecuteOutcome, RemoteError> {
        let split = Self::payload(payload).map_err(invalid_request)?;
        let request = RemoteRequest::new(
            HttpMethod::Post,
            format!("{}/split", entity_path(&op.entity)),
            Some(json!({
                "alias": split.alias,
                "new_id": split.new_id,
                "relation_owners": split.relation_owners,
            })),
        );
        let ack = remote.send(request).await?;
        // The assigned id names the new contributor, not the original.
        let created = EntityRef::contributor(split.new_id.clone());
        let mut outcome = ExecuteOutcome::from_ack(&created, ack, |id| {
            if id == &split.new_id {
                Some(EntityType::Contributor)
            } else if split.relation_owners.contains(id) {
                Some(EntityType::Book)
            } else {
                None
            }
        });
        outcome.field_corrections.clear();
        Ok(outcome)
    }

    fn apply_confirmed(
        &self,
        entity: &EntityRef,
        payload: &OperationPayload,
        outcome: &ExecuteOutcome,
        store: &dyn EntityStore,
    ) -> SyncResult<()> {
        let split = Self::payload(payload)?;
        let created = outcome.resolve(&split.new_id);
        store.modify(entity, &mut |original| {
            original.remove_alias(&split.alias);
        })?;
        Self::move_credits(
            store,
            split.relation_owners.iter().map(|owner| outcome.resolve(owner)),
            &entity.id,
            &created,
        )?;
        store.set_sync_state(&EntityRef::contributor(created), SyncState::Synced)?;
        Ok(())
    }
}
