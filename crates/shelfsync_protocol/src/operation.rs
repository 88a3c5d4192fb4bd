//! Pending operation rows and their typed payloads.

use crate::entity::{EntityId, EntityRef, FieldMap, Relation, RelationMember};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Unique, monotonically increasing identifier of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(pub u64);

impl OperationId {
    /// Returns the raw counter value.
    pub fn get(self) -> u64 {
        self.0
    }

    /// Returns the next id in sequence.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of a queued mutation.
///
/// Together with the target entity, the kind is the coalescing key of the
/// queue. Relation replacements carry their relation so that editing the
/// tags of a book never collapses into an edit of its authors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Create an entity that so far exists only locally.
    CreateEntity,
    /// Patch scalar fields.
    UpdateEntityFields,
    /// Delete an entity.
    DeleteEntity,
    /// Replace the full member list of one relation.
    ReplaceRelationSet(Relation),
    /// Fold a duplicate entity into another.
    MergeEntities,
    /// Promote an alias of a contributor into its own contributor.
    SplitAliasFromEntity,
}

impl OperationKind {
    /// Returns the handler lookup key for this kind.
    pub fn handler_key(&self) -> HandlerKey {
        match self {
            OperationKind::CreateEntity => HandlerKey::CreateEntity,
            OperationKind::UpdateEntityFields => HandlerKey::UpdateEntityFields,
            OperationKind::DeleteEntity => HandlerKey::DeleteEntity,
            OperationKind::ReplaceRelationSet(_) => HandlerKey::ReplaceRelationSet,
            OperationKind::MergeEntities => HandlerKey::MergeEntities,
            OperationKind::SplitAliasFromEntity => HandlerKey::SplitAliasFromEntity,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::ReplaceRelationSet(relation) => {
                write!(f, "replace_relation_set:{relation}")
            }
            other => f.write_str(other.handler_key().as_str()),
        }
    }
}

/// Handler registry key: an `OperationKind` with its relation erased.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HandlerKey {
    /// See [`OperationKind::CreateEntity`].
    CreateEntity,
    /// See [`OperationKind::UpdateEntityFields`].
    UpdateEntityFields,
    /// See [`OperationKind::DeleteEntity`].
    DeleteEntity,
    /// See [`OperationKind::ReplaceRelationSet`].
    ReplaceRelationSet,
    /// See [`OperationKind::MergeEntities`].
    MergeEntities,
    /// See [`OperationKind::SplitAliasFromEntity`].
    SplitAliasFromEntity,
}

impl HandlerKey {
    /// All handler keys.
    pub const ALL: [HandlerKey; 6] = [
        HandlerKey::CreateEntity,
        HandlerKey::UpdateEntityFields,
        HandlerKey::DeleteEntity,
        HandlerKey::ReplaceRelationSet,
        HandlerKey::MergeEntities,
        HandlerKey::SplitAliasFromEntity,
    ];

    /// Returns the snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKey::CreateEntity => "create_entity",
            HandlerKey::UpdateEntityFields => "update_entity_fields",
            HandlerKey::DeleteEntity => "delete_entity",
            HandlerKey::ReplaceRelationSet => "replace_relation_set",
            HandlerKey::MergeEntities => "merge_entities",
            HandlerKey::SplitAliasFromEntity => "split_alias_from_entity",
        }
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a queued row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting to be sent.
    Pending,
    /// Claimed by a flush pass; the remote call may be in progress.
    InFlight,
    /// Stopped; needs a user retry or discard.
    Failed {
        /// Human-readable failure reason.
        reason: String,
    },
    /// Confirmed by the server. Rows are removed once they reach this state.
    Completed,
}

impl OperationStatus {
    /// Returns the short lowercase name of the status.
    pub fn name(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InFlight => "in_flight",
            OperationStatus::Failed { .. } => "failed",
            OperationStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Failed { reason } => write!(f, "failed ({reason})"),
            other => f.write_str(other.name()),
        }
    }
}

/// One durable row of the pending operation queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Unique id, assigned at enqueue.
    pub id: OperationId,
    /// Operation kind.
    pub kind: OperationKind,
    /// Logical target of the operation.
    pub entity: EntityRef,
    /// Handler-serialized payload (JSON).
    pub payload: Vec<u8>,
    /// Current lifecycle state.
    pub status: OperationStatus,
    /// Number of retryable failures so far.
    pub attempt_count: u32,
    /// Server version of the entity when the edit was made.
    pub base_version: Option<u64>,
    /// When the row was first enqueued.
    pub created_at: DateTime<Utc>,
    /// When the row was last claimed for sending.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Journal revision of the latest persisted change to this row.
    pub revision: u64,
}

impl PendingOperation {
    /// Creates a fresh `Pending` row.
    pub fn new(
        id: OperationId,
        kind: OperationKind,
        entity: EntityRef,
        payload: Vec<u8>,
        base_version: Option<u64>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            kind,
            entity,
            payload,
            status: OperationStatus::Pending,
            attempt_count: 0,
            base_version,
            created_at,
            last_attempt_at: None,
            revision: 0,
        }
    }

    /// Returns true if the row is waiting to be sent.
    pub fn is_pending(&self) -> bool {
        matches!(self.status, OperationStatus::Pending)
    }

    /// Returns true if the row is stopped in `Failed`.
    pub fn is_failed(&self) -> bool {
        matches!(self.status, OperationStatus::Failed { .. })
    }

    /// Returns the failure reason, if failed.
    pub fn failure_reason(&self) -> Option<&str> {
        match &self.status {
            OperationStatus::Failed { reason } => Some(reason),
            _ => None,
        }
    }

    /// Returns true if this row, at the head of its entity, holds back the
    /// rows behind it.
    pub fn blocks_entity(&self) -> bool {
        matches!(
            self.status,
            OperationStatus::InFlight | OperationStatus::Failed { .. }
        )
    }

    /// Payload rendered as UTF-8 for display.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Payload of [`OperationKind::CreateEntity`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateEntity {
    /// Initial scalar fields.
    #[serde(default)]
    pub fields: FieldMap,
    /// Initial relation sets.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relations: BTreeMap<Relation, Vec<RelationMember>>,
}

/// Payload of [`OperationKind::UpdateEntityFields`].
///
/// Edit repositories pass the cumulative diff since the last confirmed
/// state, so a coalesced row simply carries the newest diff.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateFields {
    /// Fields to set. `null` clears a field.
    pub fields: FieldMap,
}

/// Payload of [`OperationKind::ReplaceRelationSet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaceRelationSet {
    /// Which relation is replaced.
    pub relation: Relation,
    /// The complete new member list, in display order.
    pub members: Vec<RelationMember>,
}

/// Payload of [`OperationKind::MergeEntities`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeEntities {
    /// The duplicate that disappears.
    pub source: EntityRef,
    /// The entity that survives.
    pub target: EntityRef,
    /// Display name of the source, kept as an alias of the target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_name: Option<String>,
}

/// Payload of [`OperationKind::SplitAliasFromEntity`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitAlias {
    /// The alias being promoted.
    pub alias: String,
    /// Id of the new contributor; temporary until confirmed.
    pub new_id: EntityId,
    /// Books whose credits move from the original contributor to the new one.
    #[serde(default)]
    pub relation_owners: Vec<EntityId>,
}

/// Typed payload of any operation kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OperationPayload {
    /// Create.
    Create(CreateEntity),
    /// Field patch.
    UpdateFields(UpdateFields),
    /// Delete.
    Delete,
    /// Relation replacement.
    ReplaceRelationSet(ReplaceRelationSet),
    /// Merge.
    Merge(MergeEntities),
    /// Alias split.
    SplitAlias(SplitAlias),
}

impl OperationPayload {
    /// Returns the operation kind this payload belongs to.
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationPayload::Create(_) => OperationKind::CreateEntity,
            OperationPayload::UpdateFields(_) => OperationKind::UpdateEntityFields,
            OperationPayload::Delete => OperationKind::DeleteEntity,
            OperationPayload::ReplaceRelationSet(p) => OperationKind::ReplaceRelationSet(p.relation),
            OperationPayload::Merge(_) => OperationKind::MergeEntities,
            OperationPayload::SplitAlias(_) => OperationKind::SplitAliasFromEntity,
        }
    }

    /// Replaces every reference to `from` with `to`.
    ///
    /// Returns true if anything changed.
    pub fn rewrite_id(&mut self, from: &EntityId, to: &EntityId) -> bool {
        let mut changed = false;
        let mut swap = |id: &mut EntityId| {
            if id == from {
                *id = to.clone();
                changed = true;
            }
        };
        match self {
            OperationPayload::Create(p) => {
                for member in p.relations.values_mut().flatten() {
                    swap(&mut member.id);
                }
            }
            OperationPayload::UpdateFields(_) | OperationPayload::Delete => {}
            OperationPayload::ReplaceRelationSet(p) => {
                for member in &mut p.members {
                    swap(&mut member.id);
                }
            }
            OperationPayload::Merge(p) => {
                swap(&mut p.source.id);
                swap(&mut p.target.id);
            }
            OperationPayload::SplitAlias(p) => {
                swap(&mut p.new_id);
                for owner in &mut p.relation_owners {
                    swap(owner);
                }
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityType;
    use serde_json::json;

    #[test]
    fn relation_kinds_do_not_share_a_key() {
        let tags = OperationKind::ReplaceRelationSet(Relation::Tags);
        let authors = OperationKind::ReplaceRelationSet(Relation::Authors);
        assert_ne!(tags, authors);
        assert_eq!(tags.handler_key(), authors.handler_key());
        assert_eq!(tags.to_string(), "replace_relation_set:tags");
        assert_eq!(OperationKind::MergeEntities.to_string(), "merge_entities");
    }

    #[test]
    fn payload_kind() {
        let payload = OperationPayload::ReplaceRelationSet(ReplaceRelationSet {
            relation: Relation::Series,
            members: vec![RelationMember::in_sequence("s1", "3")],
        });
        assert_eq!(payload.kind(), OperationKind::ReplaceRelationSet(Relation::Series));
        assert_eq!(OperationPayload::Delete.kind(), OperationKind::DeleteEntity);
    }

    #[test]
    fn payload_is_tagged() {
        let mut fields = FieldMap::new();
        fields.insert("title".into(), json!("B"));
        let value = serde_json::to_value(OperationPayload::UpdateFields(UpdateFields { fields }))
            .unwrap();
        assert_eq!(value, json!({ "op": "update_fields", "fields": { "title": "B" } }));

        let delete: OperationPayload = serde_json::from_value(json!({ "op": "delete" })).unwrap();
        assert_eq!(delete, OperationPayload::Delete);
    }

    #[test]
    fn rewrite_id_touches_every_reference() {
        let temp = EntityId::temporary();
        let real = EntityId::new("c_42");

        let mut merge = OperationPayload::Merge(MergeEntities {
            source: EntityRef::contributor("c_7"),
            target: EntityRef::new(EntityType::Contributor, temp.clone()),
            source_name: Some("J. Doe".into()),
        });
        assert!(merge.rewrite_id(&temp, &real));
        assert!(!merge.rewrite_id(&temp, &real));
        match merge {
            OperationPayload::Merge(m) => assert_eq!(m.target.id, real),
            other => panic!("unexpected payload {other:?}"),
        }

        let mut split = OperationPayload::SplitAlias(SplitAlias {
            alias: "Bob".into(),
            new_id: temp.clone(),
            relation_owners: vec![EntityId::new("b1")],
        });
        assert!(split.rewrite_id(&temp, &real));

        let mut patch = OperationPayload::UpdateFields(UpdateFields::default());
        assert!(!patch.rewrite_id(&temp, &real));
    }

    #[test]
    fn status_blocking() {
        let mut op = PendingOperation::new(
            OperationId(1),
            OperationKind::UpdateEntityFields,
            EntityRef::book("b1"),
            b"{}".to_vec(),
            Some(3),
            Utc::now(),
        );
        assert!(op.is_pending());
        assert!(!op.blocks_entity());

        op.status = OperationStatus::InFlight;
        assert!(op.blocks_entity());

        op.status = OperationStatus::Failed {
            reason: "Conflict: server version 5 is newer than base 3".into(),
        };
        assert!(op.blocks_entity());
        assert_eq!(op.status.name(), "failed");
        assert!(op.failure_reason().unwrap().starts_with("Conflict"));
    }

    #[test]
    fn operation_id_display() {
        assert_eq!(OperationId(12).to_string(), "#12");
        assert_eq!(OperationId(12).next(), OperationId(13));
    }
}
