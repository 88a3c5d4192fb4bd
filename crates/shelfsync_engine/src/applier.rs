//! Applies live events to the local store.
//!
//! Events are applied in stream order under the entity's lock. An event
//! whose server version is not newer than the cached one is stale and
//! ignored. Otherwise its values win over local ones, and queued operations
//! that the event shows as already applied on the server are completed.
//! The entity returns to `Synced` only when nothing else is outstanding.

use crate::error::SyncResult;
use crate::handler::{apply_fields, HandlerRegistry};
use crate::locks::EntityLocks;
use crate::queue::PendingOperationQueue;
use crate::store::{CachedEntity, EntityStore, SyncState};
use shelfsync_protocol::{
    DomainEvent, EntityRef, EntitySnapshot, PendingOperation, Relation, RelationMember,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// What applying one event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The store was updated.
    Applied {
        /// Queued operations completed because the event confirmed them.
        confirmed: usize,
        /// Whether the entity still has unconfirmed local edits.
        still_pending: bool,
    },
    /// The store already held this version or a newer one.
    Stale,
    /// Nothing to apply (heartbeat, or an unknown owner).
    Ignored,
}

/// Applies decoded events to the entity store.
pub struct EventApplier {
    store: Arc<dyn EntityStore>,
    queue: Arc<PendingOperationQueue>,
    handlers: Arc<HandlerRegistry>,
    locks: Arc<EntityLocks>,
}

impl EventApplier {
    /// Creates an applier.
    pub fn new(
        store: Arc<dyn EntityStore>,
        queue: Arc<PendingOperationQueue>,
        handlers: Arc<HandlerRegistry>,
        locks: Arc<EntityLocks>,
    ) -> Self {
        Self {
            store,
            queue,
            handlers,
            locks,
        }
    }

    /// Applies one event.
    pub async fn apply(&self, event: &DomainEvent) -> SyncResult<ApplyOutcome> {
        let outcome = match event {
            DomainEvent::Heartbeat => ApplyOutcome::Ignored,
            DomainEvent::EntityCreated(snapshot) | DomainEvent::EntityUpdated(snapshot) => {
                self.apply_snapshot(event, snapshot).await?
            }
            DomainEvent::EntityDeleted {
                entity,
                server_version,
            } => self.apply_delete(event, entity, *server_version).await?,
            DomainEvent::MembershipChanged {
                owner,
                relation,
                members,
                server_version,
            } => {
                self.apply_membership(event, owner, *relation, members, *server_version)
                    .await?
            }
            DomainEvent::EntitiesMerged {
                source,
                target,
                server_version,
            } => self.apply_merge(event, source, target, *server_version).await?,
        };
        debug!(event = %event.tag(), entity = ?event.entity(), ?outcome, "applied event");
        Ok(outcome)
    }

    async fn apply_snapshot(
        &self,
        event: &DomainEvent,
        snapshot: &EntitySnapshot,
    ) -> SyncResult<ApplyOutcome> {
        let _guard = self.locks.lock(&snapshot.entity).await;
        let known = match self.store.get(&snapshot.entity)? {
            Some(row) if snapshot.server_version <= row.server_version => {
                return Ok(ApplyOutcome::Stale)
            }
            Some(_) => true,
            None => false,
        };

        let (confirmed, still_pending) = self.settle(&snapshot.entity, event).await?;
        // Writers relinking references do not hold this entity's lock, so
        // the row is re-read and changed in place rather than overwritten.
        let state = sync_state(still_pending);
        let found = known
            && self.store.modify(&snapshot.entity, &mut |row| {
                if snapshot.server_version <= row.server_version {
                    return;
                }
                apply_fields(&mut row.fields, &snapshot.fields);
                for (relation, members) in &snapshot.relations {
                    row.relations.insert(*relation, members.clone());
                }
                row.server_version = snapshot.server_version;
                row.sync_state = state;
            })?;
        if !found {
            let mut row = CachedEntity::from_snapshot(snapshot.clone());
            row.fields.retain(|_, value| !value.is_null());
            row.sync_state = state;
            self.store.upsert(row)?;
        }
        Ok(ApplyOutcome::Applied {
            confirmed,
            still_pending,
        })
    }

    async fn apply_delete(
        &self,
        event: &DomainEvent,
        entity: &EntityRef,
        server_version: u64,
    ) -> SyncResult<ApplyOutcome> {
        let _guard = self.locks.lock(entity).await;
        match self.store.get(entity)? {
            None => return Ok(ApplyOutcome::Ignored),
            Some(row) if server_version <= row.server_version => return Ok(ApplyOutcome::Stale),
            Some(_) => {}
        }
        self.store.delete(entity)?;
        let unlinked = self.store.remove_references(entity.entity_type, &entity.id)?;
        let (confirmed, still_pending) = self.settle(entity, event).await?;
        if still_pending {
            // Remaining edits target a deleted entity and fail as conflicts.
            warn!(%entity, "entity deleted on the server with local edits outstanding");
        }
        debug!(%entity, unlinked, "entity deleted by server");
        Ok(ApplyOutcome::Applied {
            confirmed,
            still_pending,
        })
    }

    async fn apply_membership(
        &self,
        event: &DomainEvent,
        owner: &EntityRef,
        relation: Relation,
        members: &[RelationMember],
        server_version: u64,
    ) -> SyncResult<ApplyOutcome> {
        let _guard = self.locks.lock(owner).await;
        match self.store.get(owner)? {
            None => return Ok(ApplyOutcome::Ignored),
            Some(row) if server_version <= row.server_version => return Ok(ApplyOutcome::Stale),
            Some(_) => {}
        }

        let (confirmed, still_pending) = self.settle(owner, event).await?;
        self.store.modify(owner, &mut |row| {
            if server_version <= row.server_version {
                return;
            }
            row.relations.insert(relation, members.to_vec());
            row.server_version = server_version;
            row.sync_state = sync_state(still_pending);
        })?;
        Ok(ApplyOutcome::Applied {
            confirmed,
            still_pending,
        })
    }

    async fn apply_merge(
        &self,
        event: &DomainEvent,
        source: &EntityRef,
        target: &EntityRef,
        server_version: u64,
    ) -> SyncResult<ApplyOutcome> {
        let _guards = self.locks.lock_many(&[source, target]).await;
        let target_row = self.store.get(target)?;
        if target_row
            .as_ref()
            .is_some_and(|row| server_version <= row.server_version)
        {
            return Ok(ApplyOutcome::Stale);
        }
        if target_row.is_none() {
            // Only references move; the source row must not take the target's place.
            self.store.delete(source)?;
        }
        let moved = self
            .store
            .rewrite_references(source.entity_type, &source.id, &target.id)?;
        debug!(%source, %target, moved, "entities merged by server");

        if target_row.is_none() {
            return Ok(ApplyOutcome::Applied {
                confirmed: 0,
                still_pending: false,
            });
        }
        let (confirmed, still_pending) = self.settle(target, event).await?;
        self.store.modify(target, &mut |row| {
            row.server_version = server_version;
            row.sync_state = sync_state(still_pending);
        })?;
        Ok(ApplyOutcome::Applied {
            confirmed,
            still_pending,
        })
    }

    /// Completes the entity's `Pending` rows the event confirms. Returns how
    /// many were completed and whether anything is still outstanding.
    async fn settle(&self, entity: &EntityRef, event: &DomainEvent) -> SyncResult<(usize, bool)> {
        let mut confirmed = 0;
        let mut outstanding = false;
        for op in self.queue.outstanding_for(entity) {
            if op.is_pending() && self.confirms(&op, event) {
                self.queue.mark_completed(op.id).await?;
                debug!(id = %op.id, kind = %op.kind, %entity, "operation confirmed by event");
                confirmed += 1;
            } else {
                outstanding = true;
            }
        }
        Ok((confirmed, outstanding))
    }

    fn confirms(&self, op: &PendingOperation, event: &DomainEvent) -> bool {
        let handler = match self.handlers.for_kind(op.kind) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(id = %op.id, error = %e, "cannot check operation against event");
                return false;
            }
        };
        match handler.deserialize(op.kind, &op.payload) {
            Ok(payload) => handler.is_confirmed_by(&payload, event),
            Err(e) => {
                warn!(id = %op.id, error = %e, "cannot decode queued payload");
                false
            }
        }
    }
}

fn sync_state(still_pending: bool) -> SyncState {
    if still_pending {
        SyncState::Pending
    } else {
        SyncState::Synced
    }
}
