//! Relation set replacement.

use super::{
    decode, encode, invalid_request, kind_mismatch, mismatch, ExecuteOutcome, OperationHandler,
};
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::remote::{entity_path, HttpMethod, RemoteRequest, RemoteService};
use crate::store::{EntityStore, SyncState};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use shelfsync_protocol::{
    DomainEvent, EntityRef, HandlerKey, OperationKind, OperationPayload, PendingOperation,
    ReplaceRelationSet,
};

/// Handles [`OperationKind::ReplaceRelationSet`]:
/// `PUT /{collection}/{id}/{relation}` with the full member list.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplaceRelationSetHandler;

impl ReplaceRelationSetHandler {
    fn payload(payload: &OperationPayload) -> SyncResult<&ReplaceRelationSet> {
        match payload {
            OperationPayload::ReplaceRelationSet(p) => Ok(p),
            other => Err(mismatch(HandlerKey::ReplaceRelationSet, other)),
        }
    }
}

#[async_trait]
impl OperationHandler for ReplaceRelationSetHandler {
    fn key(&self) -> HandlerKey {
        HandlerKey::ReplaceRelationSet
    }

    fn serialize(&self, payload: &OperationPayload) -> SyncResult<Vec<u8>> {
        encode(Self::payload(payload)?)
    }

    fn deserialize(&self, kind: OperationKind, bytes: &[u8]) -> SyncResult<OperationPayload> {
        let OperationKind::ReplaceRelationSet(relation) = kind else {
            return Err(kind_mismatch(self.key(), kind));
        };
        let payload: ReplaceRelationSet = decode(bytes)?;
        if payload.relation != relation {
            return Err(kind_mismatch(
                self.key(),
                OperationKind::ReplaceRelationSet(payload.relation),
            ));
        }
        Ok(OperationPayload::ReplaceRelationSet(payload))
    }

    fn apply_local(
        &self,
        entity: &EntityRef,
        payload: &OperationPayload,
        store: &dyn EntityStore,
    ) -> SyncResult<()> {
        let replace = Self::payload(payload)?;
        let found = store.modify(entity, &mut |row| {
            row.relations
                .insert(replace.relation, replace.members.clone());
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
        let replace = Self::payload(payload).map_err(invalid_request)?;
        let request = RemoteRequest::new(
            HttpMethod::Put,
            format!("{}/{}", entity_path(&op.entity), replace.relation),
            Some(json!({
                "members": replace.members,
                "base_version": op.base_version,
            })),
        );
        let ack = remote.send(request).await?;
        let member_type = replace.relation.member_type();
        Ok(ExecuteOutcome::from_ack(&op.entity, ack, |id| {
            replace
                .members
                .iter()
                .any(|m| &m.id == id)
                .then_some(member_type)
        }))
    }

    fn is_confirmed_by(&self, payload: &OperationPayload, event: &DomainEvent) -> bool {
        let Ok(replace) = Self::payload(payload) else {
            return false;
        };
        match event {
            DomainEvent::EntityCreated(s) | DomainEvent::EntityUpdated(s) => {
                s.relations.get(&replace.relation) == Some(&replace.members)
            }
            DomainEvent::MembershipChanged {
                relation, members, ..
            } => *relation == replace.relation && *members == replace.members,
            _ => false,
        }
    }
}
