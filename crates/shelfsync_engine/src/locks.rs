//! Per-entity async locks.

use parking_lot::Mutex;
use shelfsync_protocol::EntityRef;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Idle lock entries are pruned once the table grows past this size.
const PRUNE_THRESHOLD: usize = 1024;

/// Serializes work on one entity while leaving other entities concurrent.
///
/// Guards are held across the conflict check and the post-success store
/// updates, never across a remote call.
#[derive(Debug, Default)]
pub struct EntityLocks {
    locks: Mutex<HashMap<EntityRef, Arc<AsyncMutex<()>>>>,
}

impl EntityLocks {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock of one entity.
    pub async fn lock(&self, entity: &EntityRef) -> OwnedMutexGuard<()> {
        self.slot(entity).lock_owned().await
    }

    /// Acquires the locks of several entities in a deadlock-free order.
    pub async fn lock_many(&self, entities: &[&EntityRef]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted: Vec<&EntityRef> = entities.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for entity in sorted {
            guards.push(self.lock(entity).await);
        }
        guards
    }

    /// Number of entries in the table.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Returns true if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.locks.lock().is_empty()
    }

    fn slot(&self, entity: &EntityRef) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        if locks.len() > PRUNE_THRESHOLD {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks.entry(entity.clone()).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_entity_is_serialized() {
        let locks = Arc::new(EntityLocks::new());
        let book = EntityRef::book("b1");

        let guard = locks.lock(&book).await;
        let waiter = {
            let locks = locks.clone();
            let book = book.clone();
            tokio::spawn(async move {
                let _g = locks.lock(&book).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn different_entities_do_not_block() {
        let locks = EntityLocks::new();
        let _a = locks.lock(&EntityRef::book("b1")).await;
        let _b = locks.lock(&EntityRef::book("b2")).await;
        assert_eq!(locks.len(), 2);
    }

    #[tokio::test]
    async fn lock_many_dedups() {
        let locks = EntityLocks::new();
        let a = EntityRef::contributor("c1");
        let b = EntityRef::contributor("c2");
        let guards = locks.lock_many(&[&b, &a, &b]).await;
        assert_eq!(guards.len(), 2);
    }
}
