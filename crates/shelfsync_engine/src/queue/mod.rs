//! Durable pending-operation queue.
//!
//! ## Ordering
//!
//! Rows are ordered by id, which is assigned monotonically at enqueue. Rows
//! of one entity are delivered strictly in that order: an entity whose
//! oldest row is in flight or failed contributes nothing to a batch.
//!
//! ## Durability
//!
//! Every mutation is handed to the [`QueueStore`] before the call returns.
//! The in-memory rows are guarded by a short synchronous lock that is
//! never held across an `.await`.

mod index;
mod journal;
mod memory;

pub use journal::{compute_crc32, JournalQueueStore, JournalStats};
pub use memory::MemoryQueueStore;

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::try_join_all;
use parking_lot::Mutex;
use shelfsync_protocol::{
    EntityId, EntityRef, EntityType, OperationId, OperationKind, OperationStatus,
    PendingOperation,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Retryable failures tolerated before a row is marked failed.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Rows and counters as loaded from a store.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    /// Live rows.
    pub operations: Vec<PendingOperation>,
    /// Next operation id to assign.
    pub next_id: u64,
    /// Next revision to stamp.
    pub next_revision: u64,
}

/// Persistence medium of the queue.
///
/// Writes may complete out of order; stores resolve them by the row's
/// `revision`, keeping the highest.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Loads all live rows.
    async fn load(&self) -> SyncResult<QueueSnapshot>;

    /// Persists the current state of a row.
    async fn put(&self, op: PendingOperation) -> SyncResult<()>;

    /// Persists the removal of a row.
    async fn remove(&self, id: OperationId, revision: u64) -> SyncResult<()>;
}

/// Result of [`PendingOperationQueue::enqueue_or_coalesce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new row was inserted.
    Inserted(OperationId),
    /// An existing pending row took the new payload.
    Coalesced(OperationId),
}

impl EnqueueOutcome {
    /// The id of the affected row.
    pub fn id(&self) -> OperationId {
        match self {
            EnqueueOutcome::Inserted(id) | EnqueueOutcome::Coalesced(id) => *id,
        }
    }

    /// Returns true if an existing row was reused.
    pub fn is_coalesced(&self) -> bool {
        matches!(self, EnqueueOutcome::Coalesced(_))
    }
}

/// Kinds that later edits of the same entity may not be folded across.
fn is_barrier(kind: OperationKind) -> bool {
    matches!(
        kind,
        OperationKind::CreateEntity
            | OperationKind::DeleteEntity
            | OperationKind::MergeEntities
            | OperationKind::SplitAliasFromEntity
    )
}

/// Finds the row a new `kind` edit of `entity` may fold into.
///
/// Ids grow with enqueue order, so walking the map backwards visits the
/// entity's rows newest first.
fn coalesce_target(
    rows: &BTreeMap<OperationId, PendingOperation>,
    kind: OperationKind,
    entity: &EntityRef,
) -> Option<OperationId> {
    for row in rows.values().rev().filter(|r| &r.entity == entity) {
        if row.kind == kind {
            return row.is_pending().then_some(row.id);
        }
        if is_barrier(row.kind) {
            return None;
        }
    }
    None
}

struct QueueState {
    rows: BTreeMap<OperationId, PendingOperation>,
    next_id: u64,
    next_revision: u64,
}

impl QueueState {
    fn bump_revision(&mut self) -> u64 {
        let revision = self.next_revision;
        self.next_revision += 1;
        revision
    }

    fn allocate_id(&mut self) -> OperationId {
        let id = OperationId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Applies `f` to a row and stamps a new revision on it.
    fn update<F>(&mut self, id: OperationId, f: F) -> SyncResult<PendingOperation>
    where
        F: FnOnce(&mut PendingOperation) -> SyncResult<()>,
    {
        let revision = self.next_revision;
        let row = self
            .rows
            .get_mut(&id)
            .ok_or(SyncError::OperationNotFound(id))?;
        f(row)?;
        row.revision = revision;
        let row = row.clone();
        self.next_revision += 1;
        Ok(row)
    }
}

/// The durable per-entity mutation queue.
pub struct PendingOperationQueue {
    store: Arc<dyn QueueStore>,
    state: Mutex<QueueState>,
    max_retries: u32,
}

impl PendingOperationQueue {
    /// Loads the queue from a store.
    ///
    /// Rows left `InFlight` by a previous process are reset to `Pending`;
    /// their delivery outcome is unknown and the remote is idempotent.
    pub async fn open(store: Arc<dyn QueueStore>, max_retries: u32) -> SyncResult<Self> {
        let snapshot = store.load().await?;
        let mut state = QueueState {
            rows: BTreeMap::new(),
            next_id: snapshot.next_id.max(1),
            next_revision: snapshot.next_revision.max(1),
        };

        let mut reset = Vec::new();
        for mut op in snapshot.operations {
            if op.status == OperationStatus::InFlight {
                op.status = OperationStatus::Pending;
                op.revision = state.bump_revision();
                reset.push(op.clone());
            }
            state.next_id = state.next_id.max(op.id.get() + 1);
            state.rows.insert(op.id, op);
        }

        if !reset.is_empty() {
            info!(count = reset.len(), "reset interrupted operations to pending");
        }
        debug!(rows = state.rows.len(), "operation queue loaded");

        let queue = Self {
            store,
            state: Mutex::new(state),
            max_retries,
        };
        queue.persist(reset).await?;
        Ok(queue)
    }

    /// Creates an empty queue backed by a [`MemoryQueueStore`].
    pub async fn in_memory() -> SyncResult<Self> {
        Self::open(Arc::new(MemoryQueueStore::new()), DEFAULT_MAX_RETRIES).await
    }

    /// Retry limit of this queue.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Enqueues an operation, folding it into an existing `Pending` row of
    /// the same entity and kind if there is one.
    ///
    /// A coalesced row keeps its id, `created_at`, attempt count and
    /// baseline; only the payload is replaced.
    pub async fn enqueue_or_coalesce(
        &self,
        kind: OperationKind,
        entity: EntityRef,
        payload: Vec<u8>,
        base_version: Option<u64>,
    ) -> SyncResult<EnqueueOutcome> {
        self.enqueue_or_coalesce_with(kind, entity, payload, base_version, |_, newer| {
            Ok(newer.to_vec())
        })
        .await
    }

    /// Like [`enqueue_or_coalesce`](Self::enqueue_or_coalesce), combining
    /// the payloads with `merge(older, newer)` instead of replacing.
    ///
    /// Only the newest row of the entity and kind is a candidate, and only
    /// while it is `Pending` with no create, delete, merge or split queued
    /// behind it. A row already in flight, or one separated from the new
    /// edit by such a barrier, keeps its payload and a new row is inserted.
    pub async fn enqueue_or_coalesce_with<M>(
        &self,
        kind: OperationKind,
        entity: EntityRef,
        payload: Vec<u8>,
        base_version: Option<u64>,
        merge: M,
    ) -> SyncResult<EnqueueOutcome>
    where
        M: FnOnce(&[u8], &[u8]) -> SyncResult<Vec<u8>>,
    {
        let (row, outcome) = {
            let mut state = self.state.lock();
            let existing = coalesce_target(&state.rows, kind, &entity);

            match existing {
                Some(id) => {
                    let row = state.update(id, |row| {
                        row.payload = merge(&row.payload, &payload)?;
                        Ok(())
                    })?;
                    (row, EnqueueOutcome::Coalesced(id))
                }
                None => {
                    let row = Self::insert(&mut state, kind, entity, payload, base_version);
                    let id = row.id;
                    (row, EnqueueOutcome::Inserted(id))
                }
            }
        };

        debug!(id = %row.id, kind = %row.kind, entity = %row.entity, coalesced = outcome.is_coalesced(), "enqueued operation");
        self.store.put(row).await?;
        Ok(outcome)
    }

    /// Enqueues an operation as a new row, never coalescing.
    pub async fn enqueue(
        &self,
        kind: OperationKind,
        entity: EntityRef,
        payload: Vec<u8>,
        base_version: Option<u64>,
    ) -> SyncResult<OperationId> {
        let row = {
            let mut state = self.state.lock();
            Self::insert(&mut state, kind, entity, payload, base_version)
        };
        let id = row.id;
        debug!(%id, kind = %row.kind, entity = %row.entity, "enqueued operation");
        self.store.put(row).await?;
        Ok(id)
    }

    fn insert(
        state: &mut QueueState,
        kind: OperationKind,
        entity: EntityRef,
        payload: Vec<u8>,
        base_version: Option<u64>,
    ) -> PendingOperation {
        let id = state.allocate_id();
        let mut row = PendingOperation::new(id, kind, entity, payload, base_version, Utc::now());
        row.revision = state.bump_revision();
        state.rows.insert(id, row.clone());
        row
    }

    /// Claims up to `limit` rows, at most one per entity.
    pub async fn next_batch(&self, limit: usize) -> SyncResult<Vec<PendingOperation>> {
        self.next_batch_excluding(limit, &HashSet::new()).await
    }

    /// Like [`next_batch`](Self::next_batch), skipping rows in `exclude`.
    ///
    /// An excluded row still heads its entity, so nothing behind it is
    /// returned either.
    pub async fn next_batch_excluding(
        &self,
        limit: usize,
        exclude: &HashSet<OperationId>,
    ) -> SyncResult<Vec<PendingOperation>> {
        let claimed = {
            let mut state = self.state.lock();
            let mut seen = HashSet::new();
            let mut ids = Vec::new();
            for row in state.rows.values() {
                if ids.len() >= limit {
                    break;
                }
                if !seen.insert(row.entity.clone()) {
                    continue;
                }
                if row.is_pending() && !exclude.contains(&row.id) {
                    ids.push(row.id);
                }
            }

            let now = Utc::now();
            let mut claimed = Vec::with_capacity(ids.len());
            for id in ids {
                claimed.push(state.update(id, |row| {
                    row.status = OperationStatus::InFlight;
                    row.last_attempt_at = Some(now);
                    Ok(())
                })?);
            }
            claimed
        };

        if let Err(e) = self.persist(claimed.clone()).await {
            warn!(error = %e, "failed to persist claimed batch; releasing it");
            {
                let mut state = self.state.lock();
                for op in &claimed {
                    let _ = state.update(op.id, |row| {
                        row.status = OperationStatus::Pending;
                        Ok(())
                    });
                }
            }
            return Err(e);
        }
        Ok(claimed)
    }

    /// Removes a row after the server confirmed it.
    ///
    /// Returns false if the row was already gone.
    pub async fn mark_completed(&self, id: OperationId) -> SyncResult<bool> {
        let revision = {
            let mut state = self.state.lock();
            match state.rows.remove(&id) {
                Some(_) => state.bump_revision(),
                None => return Ok(false),
            }
        };
        debug!(%id, "operation completed");
        self.store.remove(id, revision).await?;
        Ok(true)
    }

    /// Records a failed attempt and returns the row's new status.
    ///
    /// A retryable failure with attempts left returns the row to `Pending`
    /// and counts the attempt; anything else marks it `Failed`.
    pub async fn mark_failed(
        &self,
        id: OperationId,
        reason: impl Into<String>,
        retryable: bool,
    ) -> SyncResult<OperationStatus> {
        let reason = reason.into();
        let max_retries = self.max_retries;
        let row = {
            let mut state = self.state.lock();
            state.update(id, |row| {
                if retryable && row.attempt_count < max_retries {
                    row.attempt_count += 1;
                    row.status = OperationStatus::Pending;
                } else {
                    row.status = OperationStatus::Failed { reason };
                }
                Ok(())
            })?
        };
        let status = row.status.clone();
        self.store.put(row).await?;
        Ok(status)
    }

    /// Returns a `Failed` row to `Pending` with a fresh attempt budget,
    /// optionally moving its baseline to `new_base`.
    pub async fn retry(&self, id: OperationId, new_base: Option<u64>) -> SyncResult<()> {
        let row = {
            let mut state = self.state.lock();
            state.update(id, |row| {
                if !row.is_failed() {
                    return Err(SyncError::InvalidState {
                        id,
                        status: row.status.name().to_string(),
                    });
                }
                row.status = OperationStatus::Pending;
                row.attempt_count = 0;
                if new_base.is_some() {
                    row.base_version = new_base;
                }
                Ok(())
            })?
        };
        info!(%id, base = ?row.base_version, "operation queued for retry");
        self.store.put(row).await
    }

    /// Removes a row on user request. In-flight rows cannot be discarded.
    pub async fn discard(&self, id: OperationId) -> SyncResult<PendingOperation> {
        let (row, revision) = {
            let mut state = self.state.lock();
            let row = state
                .rows
                .get(&id)
                .ok_or(SyncError::OperationNotFound(id))?;
            if row.status == OperationStatus::InFlight {
                return Err(SyncError::InvalidState {
                    id,
                    status: row.status.name().to_string(),
                });
            }
            let row = state.rows.remove(&id).ok_or(SyncError::OperationNotFound(id))?;
            (row, state.bump_revision())
        };
        info!(%id, kind = %row.kind, entity = %row.entity, "operation discarded");
        self.store.remove(id, revision).await?;
        Ok(row)
    }

    /// Retargets rows of entity `from` at `to` after the server assigned a
    /// real id. Returns the number of rows changed.
    pub async fn rewrite_entity_id(
        &self,
        entity_type: EntityType,
        from: &EntityId,
        to: &EntityId,
    ) -> SyncResult<usize> {
        let old = EntityRef::new(entity_type, from.clone());
        let changed = self.update_where(
            |row| row.entity == old,
            |row| row.entity = row.entity.with_id(to.clone()),
        )?;
        let count = changed.len();
        self.persist(changed).await?;
        Ok(count)
    }

    /// Raises the baseline of the entity's pending rows to `version` after a
    /// successful push. Returns the number of rows changed.
    pub async fn rebase(&self, entity: &EntityRef, version: u64) -> SyncResult<usize> {
        let changed = self.update_where(
            |row| {
                &row.entity == entity
                    && row.is_pending()
                    && row.kind != OperationKind::CreateEntity
                    && row.base_version.map_or(true, |b| b < version)
            },
            |row| row.base_version = Some(version),
        )?;
        let count = changed.len();
        self.persist(changed).await?;
        Ok(count)
    }

    /// Replaces the payload of a row.
    pub async fn replace_payload(&self, id: OperationId, payload: Vec<u8>) -> SyncResult<()> {
        let row = {
            let mut state = self.state.lock();
            state.update(id, |row| {
                row.payload = payload;
                Ok(())
            })?
        };
        self.store.put(row).await
    }

    fn update_where<P, F>(&self, predicate: P, mut f: F) -> SyncResult<Vec<PendingOperation>>
    where
        P: Fn(&PendingOperation) -> bool,
        F: FnMut(&mut PendingOperation),
    {
        let mut state = self.state.lock();
        let ids: Vec<_> = state
            .rows
            .values()
            .filter(|row| predicate(row))
            .map(|row| row.id)
            .collect();
        ids.into_iter()
            .map(|id| {
                state.update(id, |row| {
                    f(row);
                    Ok(())
                })
            })
            .collect()
    }

    async fn persist(&self, rows: Vec<PendingOperation>) -> SyncResult<()> {
        try_join_all(rows.into_iter().map(|row| self.store.put(row))).await?;
        Ok(())
    }

    /// Returns a copy of a row.
    pub fn get(&self, id: OperationId) -> Option<PendingOperation> {
        self.state.lock().rows.get(&id).cloned()
    }

    /// Rows targeting `entity`, oldest first.
    pub fn outstanding_for(&self, entity: &EntityRef) -> Vec<PendingOperation> {
        self.state
            .lock()
            .rows
            .values()
            .filter(|row| &row.entity == entity)
            .cloned()
            .collect()
    }

    /// Returns true if any row targets `entity`.
    pub fn has_outstanding(&self, entity: &EntityRef) -> bool {
        self.state
            .lock()
            .rows
            .values()
            .any(|row| &row.entity == entity)
    }

    /// All rows, oldest first.
    pub fn list(&self) -> Vec<PendingOperation> {
        self.state.lock().rows.values().cloned().collect()
    }

    /// Rows stopped in `Failed`.
    pub fn failed(&self) -> Vec<PendingOperation> {
        self.state
            .lock()
            .rows
            .values()
            .filter(|row| row.is_failed())
            .cloned()
            .collect()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    /// Returns true if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use shelfsync_protocol::Relation;

    const UPDATE: OperationKind = OperationKind::UpdateEntityFields;

    fn title(t: &str) -> Vec<u8> {
        format!(r#"{{"fields":{{"title":"{t}"}}}}"#).into_bytes()
    }

    #[tokio::test]
    async fn coalesces_pending_rows() {
        let queue = PendingOperationQueue::in_memory().await.unwrap();
        let book = EntityRef::book("b1");

        let first = queue
            .enqueue_or_coalesce(UPDATE, book.clone(), title("A"), Some(3))
            .await
            .unwrap();
        let created_at = queue.get(OperationId(1)).unwrap().created_at;

        // One retryable attempt puts the row back to Pending with a count.
        queue.next_batch(1).await.unwrap();
        let status = queue.mark_failed(OperationId(1), "HTTP 503", true).await.unwrap();
        assert_eq!(status, OperationStatus::Pending);

        let second = queue
            .enqueue_or_coalesce(UPDATE, book.clone(), title("B"), Some(4))
            .await
            .unwrap();

        assert_eq!(first, EnqueueOutcome::Inserted(OperationId(1)));
        assert_eq!(second, EnqueueOutcome::Coalesced(OperationId(1)));
        assert_eq!(queue.len(), 1);

        let row = queue.get(OperationId(1)).unwrap();
        assert_eq!(row.payload, title("B"));
        assert_eq!(row.base_version, Some(3));
        assert_eq!(row.attempt_count, 1);
        assert_eq!(row.created_at, created_at);
        assert_eq!(row.status, OperationStatus::Pending);
    }

    #[tokio::test]
    async fn different_relations_do_not_coalesce() {
        let queue = PendingOperationQueue::in_memory().await.unwrap();
        let book = EntityRef::book("b1");
        for relation in [Relation::Tags, Relation::Genres, Relation::Tags] {
            queue
                .enqueue_or_coalesce(
                    OperationKind::ReplaceRelationSet(relation),
                    book.clone(),
                    b"{}".to_vec(),
                    Some(1),
                )
                .await
                .unwrap();
        }
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn in_flight_rows_are_not_coalesced_into() {
        let queue = PendingOperationQueue::in_memory().await.unwrap();
        let book = EntityRef::book("b1");
        queue
            .enqueue_or_coalesce(UPDATE, book.clone(), title("A"), Some(1))
            .await
            .unwrap();
        assert_eq!(queue.next_batch(10).await.unwrap().len(), 1);

        let outcome = queue
            .enqueue_or_coalesce(UPDATE, book.clone(), title("B"), Some(1))
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Inserted(OperationId(2)));
    }

    #[tokio::test]
    async fn edits_fold_into_the_newest_row_only() {
        let queue = PendingOperationQueue::in_memory().await.unwrap();
        let book = EntityRef::book("b1");
        queue
            .enqueue_or_coalesce(UPDATE, book.clone(), title("A"), Some(1))
            .await
            .unwrap();
        queue.next_batch(1).await.unwrap();
        let during_flight = queue
            .enqueue_or_coalesce(UPDATE, book.clone(), title("B"), Some(1))
            .await
            .unwrap();
        assert_eq!(during_flight, EnqueueOutcome::Inserted(OperationId(2)));

        // The older row comes back to Pending after a timeout.
        queue.mark_failed(OperationId(1), "timeout", true).await.unwrap();
        let later = queue
            .enqueue_or_coalesce(UPDATE, book.clone(), title("C"), Some(1))
            .await
            .unwrap();

        assert_eq!(later, EnqueueOutcome::Coalesced(OperationId(2)));
        assert_eq!(queue.get(OperationId(1)).unwrap().payload, title("A"));
        assert_eq!(queue.get(OperationId(2)).unwrap().payload, title("C"));
    }

    #[tokio::test]
    async fn barrier_kinds_stop_coalescing() {
        let queue = PendingOperationQueue::in_memory().await.unwrap();
        let book = EntityRef::book("b1");
        queue
            .enqueue_or_coalesce(UPDATE, book.clone(), title("A"), Some(1))
            .await
            .unwrap();
        queue
            .enqueue(OperationKind::DeleteEntity, book.clone(), b"{}".to_vec(), Some(1))
            .await
            .unwrap();
        let outcome = queue
            .enqueue_or_coalesce(UPDATE, book.clone(), title("B"), Some(1))
            .await
            .unwrap();

        assert_eq!(outcome, EnqueueOutcome::Inserted(OperationId(3)));
        assert_eq!(queue.get(OperationId(1)).unwrap().payload, title("A"));

        // A relation edit in between is not a barrier.
        let other = EntityRef::book("b2");
        queue
            .enqueue_or_coalesce(UPDATE, other.clone(), title("X"), Some(1))
            .await
            .unwrap();
        queue
            .enqueue_or_coalesce(
                OperationKind::ReplaceRelationSet(Relation::Tags),
                other.clone(),
                b"{}".to_vec(),
                Some(1),
            )
            .await
            .unwrap();
        let outcome = queue
            .enqueue_or_coalesce(UPDATE, other, title("Y"), Some(1))
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Coalesced(OperationId(4)));
    }

    #[tokio::test]
    async fn coalescing_merges_payloads() {
        let queue = PendingOperationQueue::in_memory().await.unwrap();
        let book = EntityRef::book("b1");
        let concat = |older: &[u8], newer: &[u8]| -> SyncResult<Vec<u8>> {
            Ok([older, &b"+"[..], newer].concat())
        };
        queue
            .enqueue_or_coalesce_with(UPDATE, book.clone(), b"a".to_vec(), Some(1), concat)
            .await
            .unwrap();
        queue
            .enqueue_or_coalesce_with(UPDATE, book.clone(), b"b".to_vec(), Some(1), concat)
            .await
            .unwrap();

        assert_eq!(queue.get(OperationId(1)).unwrap().payload, b"a+b".to_vec());
    }

    #[tokio::test]
    async fn failed_merge_leaves_the_row_untouched() {
        let queue = PendingOperationQueue::in_memory().await.unwrap();
        let book = EntityRef::book("b1");
        queue
            .enqueue_or_coalesce(UPDATE, book.clone(), title("A"), Some(1))
            .await
            .unwrap();
        let result = queue
            .enqueue_or_coalesce_with(UPDATE, book, title("B"), Some(1), |_, _| {
                Err(SyncError::OperationNotFound(OperationId(9)))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(queue.get(OperationId(1)).unwrap().payload, title("A"));
    }

    #[tokio::test]
    async fn batch_takes_one_row_per_entity() {
        let queue = PendingOperationQueue::in_memory().await.unwrap();
        let b1 = EntityRef::book("b1");
        let b2 = EntityRef::book("b2");
        queue.enqueue(UPDATE, b1.clone(), title("A"), Some(1)).await.unwrap();
        queue.enqueue(OperationKind::DeleteEntity, b1.clone(), b"{}".to_vec(), Some(1)).await.unwrap();
        queue.enqueue(UPDATE, b2.clone(), title("C"), Some(1)).await.unwrap();

        let batch = queue.next_batch(10).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![OperationId(1), OperationId(3)]);
        assert!(batch.iter().all(|r| r.status == OperationStatus::InFlight));
        assert!(batch.iter().all(|r| r.last_attempt_at.is_some()));

        // Heads are in flight, so nothing else is available.
        assert!(queue.next_batch(10).await.unwrap().is_empty());

        queue.mark_completed(OperationId(1)).await.unwrap();
        let batch = queue.next_batch(10).await.unwrap();
        assert_eq!(batch[0].id, OperationId(2));
    }

    #[tokio::test]
    async fn failed_head_blocks_its_entity() {
        let queue = PendingOperationQueue::in_memory().await.unwrap();
        let book = EntityRef::book("b1");
        queue.enqueue(UPDATE, book.clone(), title("A"), Some(1)).await.unwrap();
        queue.enqueue(UPDATE, book.clone(), title("B"), Some(1)).await.unwrap();

        queue.next_batch(1).await.unwrap();
        queue.mark_failed(OperationId(1), "HTTP 422: invalid", false).await.unwrap();
        assert!(queue.next_batch(10).await.unwrap().is_empty());
        assert_eq!(queue.failed().len(), 1);
    }

    #[tokio::test]
    async fn retryable_failures_are_bounded() {
        let queue = PendingOperationQueue::in_memory().await.unwrap();
        let id = queue
            .enqueue(UPDATE, EntityRef::book("b1"), title("A"), Some(1))
            .await
            .unwrap();

        for attempt in 1..=DEFAULT_MAX_RETRIES {
            queue.next_batch(1).await.unwrap();
            let status = queue.mark_failed(id, "HTTP 503", true).await.unwrap();
            assert_eq!(status, OperationStatus::Pending);
            assert_eq!(queue.get(id).unwrap().attempt_count, attempt);
        }

        queue.next_batch(1).await.unwrap();
        let status = queue.mark_failed(id, "HTTP 503", true).await.unwrap();
        assert_eq!(
            status,
            OperationStatus::Failed {
                reason: "HTTP 503".into()
            }
        );
    }

    #[tokio::test]
    async fn retry_resets_attempts_and_rebases() {
        let queue = PendingOperationQueue::in_memory().await.unwrap();
        let id = queue
            .enqueue(UPDATE, EntityRef::book("b1"), title("A"), Some(1))
            .await
            .unwrap();

        assert!(matches!(
            queue.retry(id, Some(5)).await,
            Err(SyncError::InvalidState { .. })
        ));

        queue.mark_failed(id, "HTTP 503", true).await.unwrap();
        queue.mark_failed(id, "Conflict", false).await.unwrap();
        queue.retry(id, Some(5)).await.unwrap();

        let row = queue.get(id).unwrap();
        assert!(row.is_pending());
        assert_eq!(row.attempt_count, 0);
        assert_eq!(row.base_version, Some(5));
    }

    #[tokio::test]
    async fn discard_refuses_in_flight_rows() {
        let queue = PendingOperationQueue::in_memory().await.unwrap();
        let id = queue
            .enqueue(UPDATE, EntityRef::book("b1"), title("A"), Some(1))
            .await
            .unwrap();
        queue.next_batch(1).await.unwrap();
        assert!(queue.discard(id).await.is_err());

        queue.mark_failed(id, "Conflict", false).await.unwrap();
        let row = queue.discard(id).await.unwrap();
        assert_eq!(row.id, id);
        assert!(queue.is_empty());
        assert!(matches!(
            queue.discard(id).await,
            Err(SyncError::OperationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn rewrite_and_rebase() {
        let queue = PendingOperationQueue::in_memory().await.unwrap();
        let temp = EntityId::temporary();
        let local = EntityRef::new(EntityType::Contributor, temp.clone());
        queue
            .enqueue(OperationKind::CreateEntity, local.clone(), b"{}".to_vec(), None)
            .await
            .unwrap();
        queue.enqueue(UPDATE, local.clone(), title("A"), None).await.unwrap();

        let real = EntityId::new("c_77");
        let changed = queue
            .rewrite_entity_id(EntityType::Contributor, &temp, &real)
            .await
            .unwrap();
        assert_eq!(changed, 2);
        assert!(queue.outstanding_for(&local).is_empty());

        let target = EntityRef::contributor("c_77");
        assert_eq!(queue.rebase(&target, 1).await.unwrap(), 1);
        let rows = queue.outstanding_for(&target);
        assert_eq!(rows[0].base_version, None);
        assert_eq!(rows[1].base_version, Some(1));
    }

    #[tokio::test]
    async fn reopen_resets_in_flight_rows() {
        let store = Arc::new(MemoryQueueStore::new());
        let queue = PendingOperationQueue::open(store.clone(), DEFAULT_MAX_RETRIES)
            .await
            .unwrap();
        queue.enqueue(UPDATE, EntityRef::book("b1"), title("A"), Some(1)).await.unwrap();
        queue.enqueue(UPDATE, EntityRef::book("b2"), title("B"), Some(1)).await.unwrap();
        queue.next_batch(1).await.unwrap();
        drop(queue);

        let reopened = PendingOperationQueue::open(store, DEFAULT_MAX_RETRIES)
            .await
            .unwrap();
        assert_eq!(reopened.len(), 2);
        assert!(reopened.list().iter().all(|r| r.is_pending()));

        let id = reopened
            .enqueue(UPDATE, EntityRef::book("b3"), title("C"), Some(1))
            .await
            .unwrap();
        assert_eq!(id, OperationId(3));
    }

    #[tokio::test]
    async fn every_mutation_is_persisted() {
        let store = Arc::new(MemoryQueueStore::new());
        let queue = PendingOperationQueue::open(store.clone(), DEFAULT_MAX_RETRIES)
            .await
            .unwrap();
        let id = queue
            .enqueue(UPDATE, EntityRef::book("b1"), title("A"), Some(1))
            .await
            .unwrap();
        queue.next_batch(1).await.unwrap();
        queue.mark_completed(id).await.unwrap();
        assert_eq!(store.writes(), 3);
        assert!(store.is_empty());
    }

    proptest! {
        #[test]
        fn offline_edits_leave_one_row_with_last_payload(
            titles in proptest::collection::vec("[A-Za-z ]{1,12}", 1..20),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let queue = PendingOperationQueue::in_memory().await.unwrap();
                let book = EntityRef::book("b1");
                for t in &titles {
                    queue
                        .enqueue_or_coalesce(UPDATE, book.clone(), title(t), Some(1))
                        .await
                        .unwrap();
                }
                let rows = queue.list();
                prop_assert_eq!(rows.len(), 1);
                prop_assert_eq!(&rows[0].payload, &title(titles.last().unwrap()));
                Ok(())
            })?;
        }
    }
}
