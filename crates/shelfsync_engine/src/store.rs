//! Local entity store seam.
//!
//! The engine only touches the sync-relevant part of the client's entity
//! store: server version, sync state, the field map and relation sets.

use crate::error::SyncResult;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use shelfsync_protocol::{
    EntityId, EntityRef, EntitySnapshot, EntityType, FieldMap, Relation, RelationMember,
};
use std::collections::{BTreeMap, HashMap};

/// Field holding a contributor's alternative names.
pub const ALIASES_FIELD: &str = "aliases";

/// Per-entity sync lifecycle tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// Local state matches the last server state we know of.
    Synced,
    /// Local edits have not been confirmed by the server.
    Pending,
}

/// An entity as held by the local store.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntity {
    /// Which entity.
    pub entity: EntityRef,
    /// Last server version applied; 0 for entities created offline.
    pub server_version: u64,
    /// Scalar fields.
    pub fields: FieldMap,
    /// Relation sets.
    pub relations: BTreeMap<Relation, Vec<RelationMember>>,
    /// Sync lifecycle tag.
    pub sync_state: SyncState,
    /// Time of the last local edit.
    pub last_modified: DateTime<Utc>,
    /// Deleted locally; hidden until the server confirms.
    pub tombstoned: bool,
}

impl CachedEntity {
    /// Creates a `Synced` entity from server state.
    pub fn from_snapshot(snapshot: EntitySnapshot) -> Self {
        Self {
            entity: snapshot.entity,
            server_version: snapshot.server_version,
            fields: snapshot.fields,
            relations: snapshot.relations,
            sync_state: SyncState::Synced,
            last_modified: Utc::now(),
            tombstoned: false,
        }
    }

    /// Creates a `Pending` entity that exists only on this device.
    pub fn local(entity: EntityRef) -> Self {
        Self {
            entity,
            server_version: 0,
            fields: FieldMap::new(),
            relations: BTreeMap::new(),
            sync_state: SyncState::Pending,
            last_modified: Utc::now(),
            tombstoned: false,
        }
    }

    /// Display name, from `name` or `title`.
    pub fn display_name(&self) -> Option<&str> {
        self.fields
            .get("name")
            .or_else(|| self.fields.get("title"))
            .and_then(|v| v.as_str())
    }

    /// Alternative names of the entity.
    pub fn aliases(&self) -> Vec<String> {
        self.fields
            .get(ALIASES_FIELD)
            .and_then(|v| v.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Adds an alias unless already present. Returns true if added.
    pub fn add_alias(&mut self, alias: &str) -> bool {
        let mut aliases = self.aliases();
        if aliases.iter().any(|a| a == alias) {
            return false;
        }
        aliases.push(alias.to_string());
        self.fields
            .insert(ALIASES_FIELD.to_string(), serde_json::json!(aliases));
        true
    }

    /// Removes an alias. Returns true if it was present.
    pub fn remove_alias(&mut self, alias: &str) -> bool {
        let mut aliases = self.aliases();
        let before = aliases.len();
        aliases.retain(|a| a != alias);
        if aliases.len() == before {
            return false;
        }
        self.fields
            .insert(ALIASES_FIELD.to_string(), serde_json::json!(aliases));
        true
    }

    /// Returns true if any relation of this entity lists `id` as a member
    /// of type `member_type`.
    pub fn references(&self, member_type: EntityType, id: &EntityId) -> bool {
        self.relations.iter().any(|(relation, members)| {
            relation.member_type() == member_type && members.iter().any(|m| &m.id == id)
        })
    }

    /// Replaces member `from` with `to` in every relation holding members of
    /// `member_type`, dropping duplicates. Returns true if anything changed.
    pub fn relink(&mut self, member_type: EntityType, from: &EntityId, to: &EntityId) -> bool {
        self.relink_in(None, member_type, from, to)
    }

    /// Like [`relink`](Self::relink), restricted to one relation when given.
    pub fn relink_in(
        &mut self,
        only: Option<Relation>,
        member_type: EntityType,
        from: &EntityId,
        to: &EntityId,
    ) -> bool {
        let mut changed = false;
        for (relation, members) in self.relations.iter_mut() {
            if relation.member_type() != member_type || only.is_some_and(|r| r != *relation) {
                continue;
            }
            if !members.iter().any(|m| &m.id == from) {
                continue;
            }
            let mut seen = Vec::with_capacity(members.len());
            members.retain_mut(|m| {
                if &m.id == from {
                    m.id = to.clone();
                }
                if seen.contains(&m.id) {
                    return false;
                }
                seen.push(m.id.clone());
                true
            });
            changed = true;
        }
        changed
    }

    /// Drops member `id` from relations holding `member_type`.
    pub fn unlink(&mut self, member_type: EntityType, id: &EntityId) -> bool {
        let mut changed = false;
        for (relation, members) in self.relations.iter_mut() {
            if relation.member_type() != member_type {
                continue;
            }
            let before = members.len();
            members.retain(|m| &m.id != id);
            changed |= members.len() != before;
        }
        changed
    }
}

/// The local entity store, as seen by the engine.
///
/// Implementations must be internally synchronized. The engine serializes
/// work on a single entity through [`EntityLocks`](crate::EntityLocks), so a
/// store only needs to make each call atomic.
pub trait EntityStore: Send + Sync {
    /// Fetches an entity.
    fn get(&self, entity: &EntityRef) -> SyncResult<Option<CachedEntity>>;

    /// Inserts or replaces an entity.
    fn upsert(&self, entity: CachedEntity) -> SyncResult<()>;

    /// Removes an entity. Returns true if it existed.
    fn delete(&self, entity: &EntityRef) -> SyncResult<bool>;

    /// Applies `f` to an entity in place. Returns false if it does not exist.
    fn modify(
        &self,
        entity: &EntityRef,
        f: &mut dyn FnMut(&mut CachedEntity),
    ) -> SyncResult<bool>;

    /// Retargets every reference to `from` at `to`: the entity row itself
    /// and relation members of the same type.
    ///
    /// Returns the number of rows changed; a repeated call returns 0.
    fn rewrite_references(
        &self,
        entity_type: EntityType,
        from: &EntityId,
        to: &EntityId,
    ) -> SyncResult<usize>;

    /// Drops `id` from every relation set. Returns the number of owners changed.
    fn remove_references(&self, entity_type: EntityType, id: &EntityId) -> SyncResult<usize>;

    /// All entities.
    fn list(&self) -> SyncResult<Vec<CachedEntity>>;

    /// Sets the sync state. Returns false if the entity does not exist.
    fn set_sync_state(&self, entity: &EntityRef, state: SyncState) -> SyncResult<bool> {
        self.modify(entity, &mut |e| e.sync_state = state)
    }
}

/// In-memory [`EntityStore`].
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    entities: RwLock<HashMap<EntityRef, CachedEntity>>,
}

impl MemoryEntityStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store with server state.
    pub fn with_snapshots(snapshots: impl IntoIterator<Item = EntitySnapshot>) -> Self {
        let entities = snapshots
            .into_iter()
            .map(|s| (s.entity.clone(), CachedEntity::from_snapshot(s)))
            .collect();
        Self {
            entities: RwLock::new(entities),
        }
    }

    /// Number of entities.
    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    /// Returns true if empty.
    pub fn is_empty(&self) -> bool {
        self.entities.read().is_empty()
    }

    /// Returns the sync state of an entity.
    pub fn sync_state(&self, entity: &EntityRef) -> Option<SyncState> {
        self.entities.read().get(entity).map(|e| e.sync_state)
    }
}

impl EntityStore for MemoryEntityStore {
    fn get(&self, entity: &EntityRef) -> SyncResult<Option<CachedEntity>> {
        Ok(self.entities.read().get(entity).cloned())
    }

    fn upsert(&self, entity: CachedEntity) -> SyncResult<()> {
        self.entities.write().insert(entity.entity.clone(), entity);
        Ok(())
    }

    fn delete(&self, entity: &EntityRef) -> SyncResult<bool> {
        Ok(self.entities.write().remove(entity).is_some())
    }

    fn modify(
        &self,
        entity: &EntityRef,
        f: &mut dyn FnMut(&mut CachedEntity),
    ) -> SyncResult<bool> {
        match self.entities.write().get_mut(entity) {
            Some(e) => {
                f(e);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn rewrite_references(
        &self,
        entity_type: EntityType,
        from: &EntityId,
        to: &EntityId,
    ) -> SyncResult<usize> {
        if from == to {
            return Ok(0);
        }
        let mut entities = self.entities.write();
        let mut changed = 0;

        let old_key = EntityRef::new(entity_type, from.clone());
        if let Some(mut row) = entities.remove(&old_key) {
            let new_key = old_key.with_id(to.clone());
            // A row already stored under the new id came from the server and wins.
            if !entities.contains_key(&new_key) {
                row.entity = new_key.clone();
                entities.insert(new_key, row);
            }
            changed += 1;
        }

        for row in entities.values_mut() {
            if row.relink(entity_type, from, to) {
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn remove_references(&self, entity_type: EntityType, id: &EntityId) -> SyncResult<usize> {
        let mut entities = self.entities.write();
        Ok(entities
            .values_mut()
            .map(|row| row.unlink(entity_type, id))
            .filter(|changed| *changed)
            .count())
    }

    fn list(&self) -> SyncResult<Vec<CachedEntity>> {
        let mut all: Vec<_> = self.entities.read().values().cloned().collect();
        all.sort_by(|a, b| a.entity.cmp(&b.entity));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn book_with_authors(id: &str, authors: &[&str]) -> EntitySnapshot {
        EntitySnapshot::new(EntityRef::book(id), 1).with_relation(
            Relation::Authors,
            authors.iter().map(|a| RelationMember::new(*a)).collect(),
        )
    }

    #[test]
    fn rewrite_references_is_idempotent() {
        let temp = EntityId::temporary();
        let store = MemoryEntityStore::with_snapshots([
            book_with_authors("b1", &[temp.as_str(), "c2"]),
            book_with_authors("b2", &["c2"]),
        ]);
        store
            .upsert(CachedEntity::local(EntityRef::new(EntityType::Contributor, temp.clone())))
            .unwrap();

        let real = EntityId::new("c9");
        assert_eq!(
            store
                .rewrite_references(EntityType::Contributor, &temp, &real)
                .unwrap(),
            2
        );
        assert_eq!(
            store
                .rewrite_references(EntityType::Contributor, &temp, &real)
                .unwrap(),
            0
        );

        let b1 = store.get(&EntityRef::book("b1")).unwrap().unwrap();
        assert_eq!(
            b1.relations[&Relation::Authors],
            vec![RelationMember::new("c9"), RelationMember::new("c2")]
        );
        assert!(store.get(&EntityRef::contributor("c9")).unwrap().is_some());
    }

    #[test]
    fn relink_drops_duplicates() {
        let mut book = CachedEntity::from_snapshot(book_with_authors("b1", &["c1", "c2", "c3"]));
        assert!(book.relink(EntityType::Contributor, &"c1".into(), &"c3".into()));
        assert_eq!(
            book.relations[&Relation::Authors],
            vec![RelationMember::new("c3"), RelationMember::new("c2")]
        );
        // Tags hold tag ids; a contributor relink never touches them.
        assert!(!book.relink(EntityType::Tag, &"c2".into(), &"c4".into()));
    }

    #[test]
    fn aliases_round_trip_through_fields() {
        let mut contributor = CachedEntity::from_snapshot(
            EntitySnapshot::new(EntityRef::contributor("c1"), 3).with_field("name", json!("Ann")),
        );
        assert!(contributor.aliases().is_empty());
        assert!(contributor.add_alias("A. Smith"));
        assert!(!contributor.add_alias("A. Smith"));
        assert_eq!(contributor.fields[ALIASES_FIELD], json!(["A. Smith"]));
        assert!(contributor.remove_alias("A. Smith"));
        assert!(!contributor.remove_alias("A. Smith"));
        assert_eq!(contributor.display_name(), Some("Ann"));
    }

    #[test]
    fn remove_references_counts_owners() {
        let store = MemoryEntityStore::with_snapshots([
            book_with_authors("b1", &["c1"]),
            book_with_authors("b2", &["c1", "c2"]),
            book_with_authors("b3", &["c2"]),
        ]);
        assert_eq!(
            store
                .remove_references(EntityType::Contributor, &"c1".into())
                .unwrap(),
            2
        );
    }

    #[test]
    fn sync_state_mutator() {
        let store = MemoryEntityStore::with_snapshots([book_with_authors("b1", &[])]);
        let b1 = EntityRef::book("b1");
        assert_eq!(store.sync_state(&b1), Some(SyncState::Synced));
        assert!(store.set_sync_state(&b1, SyncState::Pending).unwrap());
        assert_eq!(store.sync_state(&b1), Some(SyncState::Pending));
        assert!(!store
            .set_sync_state(&EntityRef::book("missing"), SyncState::Pending)
            .unwrap());
    }
}
