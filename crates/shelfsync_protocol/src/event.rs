//! Server-pushed domain events.
//!
//! Every stream record is an envelope with a type tag and a JSON payload:
//!
//! ```json
//! {"type": "book.updated", "data": {"id": "b1", "version": 7, "fields": {"title": "Dune"}}}
//! ```
//!
//! Tags are `<entity>.<action>` where action is one of `created`,
//! `updated`, `deleted`, `membership_changed` or `merged`, plus the bare
//! `heartbeat` tag used for liveness.

use crate::entity::{EntityId, EntityRef, EntitySnapshot, EntityType, FieldMap, Relation, RelationMember};
use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Type tag of liveness records.
pub const HEARTBEAT_TAG: &str = "heartbeat";

/// A decoded server event.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    /// An entity was created on the server.
    EntityCreated(EntitySnapshot),
    /// An entity's fields or relations changed.
    EntityUpdated(EntitySnapshot),
    /// An entity was deleted.
    EntityDeleted {
        /// The deleted entity.
        entity: EntityRef,
        /// Server version of the deletion.
        server_version: u64,
    },
    /// A collection-like relation of an entity was replaced.
    MembershipChanged {
        /// Entity owning the relation.
        owner: EntityRef,
        /// Which relation.
        relation: Relation,
        /// The complete new member list.
        members: Vec<RelationMember>,
        /// Server version of the owner after the change.
        server_version: u64,
    },
    /// Two duplicate entities were merged.
    EntitiesMerged {
        /// The entity that no longer exists.
        source: EntityRef,
        /// The surviving entity.
        target: EntityRef,
        /// Server version of the target after the merge.
        server_version: u64,
    },
    /// Liveness signal; carries nothing.
    Heartbeat,
}

impl DomainEvent {
    /// Returns the primary entity the event concerns.
    pub fn entity(&self) -> Option<&EntityRef> {
        match self {
            DomainEvent::EntityCreated(s) | DomainEvent::EntityUpdated(s) => Some(&s.entity),
            DomainEvent::EntityDeleted { entity, .. } => Some(entity),
            DomainEvent::MembershipChanged { owner, .. } => Some(owner),
            DomainEvent::EntitiesMerged { target, .. } => Some(target),
            DomainEvent::Heartbeat => None,
        }
    }

    /// Returns the server version carried by the event.
    pub fn server_version(&self) -> Option<u64> {
        match self {
            DomainEvent::EntityCreated(s) | DomainEvent::EntityUpdated(s) => {
                Some(s.server_version)
            }
            DomainEvent::EntityDeleted { server_version, .. }
            | DomainEvent::MembershipChanged { server_version, .. }
            | DomainEvent::EntitiesMerged { server_version, .. } => Some(*server_version),
            DomainEvent::Heartbeat => None,
        }
    }

    /// Returns true for liveness-only events.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, DomainEvent::Heartbeat)
    }

    /// Returns the wire type tag of this event.
    pub fn tag(&self) -> String {
        let (entity_type, action) = match self {
            DomainEvent::EntityCreated(s) => (s.entity.entity_type, "created"),
            DomainEvent::EntityUpdated(s) => (s.entity.entity_type, "updated"),
            DomainEvent::EntityDeleted { entity, .. } => (entity.entity_type, "deleted"),
            DomainEvent::MembershipChanged { owner, .. } => {
                (owner.entity_type, "membership_changed")
            }
            DomainEvent::EntitiesMerged { target, .. } => (target.entity_type, "merged"),
            DomainEvent::Heartbeat => return HEARTBEAT_TAG.to_string(),
        };
        format!("{entity_type}.{action}")
    }
}

/// Raw stream record before decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Type tag.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Type-specific payload.
    #[serde(default)]
    pub data: Value,
}

impl EventEnvelope {
    /// Parses one record.
    pub fn parse(record: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(record)?)
    }

    /// Builds the envelope a server would send for `event`.
    pub fn from_event(event: &DomainEvent) -> Self {
        let data = match event {
            DomainEvent::EntityCreated(s) | DomainEvent::EntityUpdated(s) => {
                serde_json::json!({
                    "id": s.entity.id,
                    "version": s.server_version,
                    "fields": s.fields,
                    "relations": s.relations,
                })
            }
            DomainEvent::EntityDeleted {
                entity,
                server_version,
            } => serde_json::json!({ "id": entity.id, "version": server_version }),
            DomainEvent::MembershipChanged {
                owner,
                relation,
                members,
                server_version,
            } => serde_json::json!({
                "id": owner.id,
                "version": server_version,
                "relation": relation,
                "members": members,
            }),
            DomainEvent::EntitiesMerged {
                source,
                target,
                server_version,
            } => serde_json::json!({
                "source_id": source.id,
                "target_id": target.id,
                "version": server_version,
            }),
            DomainEvent::Heartbeat => Value::Null,
        };
        Self {
            event_type: event.tag(),
            data,
        }
    }

    /// Serializes the envelope as one newline-free record.
    pub fn to_record(&self) -> String {
        // Value and String fields always serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Deserialize)]
struct EntityData {
    id: EntityId,
    version: u64,
    #[serde(default)]
    fields: FieldMap,
    #[serde(default)]
    relations: BTreeMap<Relation, Vec<RelationMember>>,
}

#[derive(Deserialize)]
struct DeleteData {
    id: EntityId,
    version: u64,
}

#[derive(Deserialize)]
struct MembershipData {
    id: EntityId,
    version: u64,
    relation: Relation,
    #[serde(default)]
    members: Vec<RelationMember>,
}

#[derive(Deserialize)]
struct MergeData {
    source_id: EntityId,
    target_id: EntityId,
    version: u64,
}

enum Action {
    Created,
    Updated,
    Deleted,
    MembershipChanged,
    Merged,
}

impl Action {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Action::Created),
            "updated" => Some(Action::Updated),
            "deleted" => Some(Action::Deleted),
            "membership_changed" => Some(Action::MembershipChanged),
            "merged" => Some(Action::Merged),
            _ => None,
        }
    }
}

/// Maps envelopes onto the closed set of [`DomainEvent`]s.
///
/// Unknown tags are dropped so that older clients tolerate newer servers.
/// Known tags with malformed payloads are reported by [`try_decode`] and
/// logged and skipped by [`decode`].
///
/// [`try_decode`]: EventDecoder::try_decode
/// [`decode`]: EventDecoder::decode
#[derive(Debug, Clone, Copy, Default)]
pub struct EventDecoder;

impl EventDecoder {
    /// Creates a decoder.
    pub fn new() -> Self {
        Self
    }

    /// Decodes an envelope.
    ///
    /// Returns `Ok(None)` for unknown tags.
    pub fn try_decode(&self, envelope: &EventEnvelope) -> ProtocolResult<Option<DomainEvent>> {
        let tag = envelope.event_type.as_str();
        if tag.is_empty() {
            return Err(ProtocolError::InvalidTag(tag.to_string()));
        }
        if tag == HEARTBEAT_TAG {
            return Ok(Some(DomainEvent::Heartbeat));
        }

        let Some((entity_name, action_name)) = tag.split_once('.') else {
            return Ok(None);
        };
        let (Ok(entity_type), Some(action)) =
            (entity_name.parse::<EntityType>(), Action::parse(action_name))
        else {
            return Ok(None);
        };

        let data = envelope.data.clone();
        let malformed = |e: serde_json::Error| ProtocolError::malformed(tag, e.to_string());

        let event = match action {
            Action::Created | Action::Updated => {
                let d: EntityData = serde_json::from_value(data).map_err(malformed)?;
                let snapshot = EntitySnapshot {
                    entity: EntityRef::new(entity_type, d.id),
                    server_version: d.version,
                    fields: d.fields,
                    relations: d.relations,
                };
                if matches!(action, Action::Created) {
                    DomainEvent::EntityCreated(snapshot)
                } else {
                    DomainEvent::EntityUpdated(snapshot)
                }
            }
            Action::Deleted => {
                let d: DeleteData = serde_json::from_value(data).map_err(malformed)?;
                DomainEvent::EntityDeleted {
                    entity: EntityRef::new(entity_type, d.id),
                    server_version: d.version,
                }
            }
            Action::MembershipChanged => {
                let d: MembershipData = serde_json::from_value(data).map_err(malformed)?;
                DomainEvent::MembershipChanged {
                    owner: EntityRef::new(entity_type, d.id),
                    relation: d.relation,
                    members: d.members,
                    server_version: d.version,
                }
            }
            Action::Merged => {
                let d: MergeData = serde_json::from_value(data).map_err(malformed)?;
                if d.source_id == d.target_id {
                    return Err(ProtocolError::malformed(tag, "source and target are the same"));
                }
                DomainEvent::EntitiesMerged {
                    source: EntityRef::new(entity_type, d.source_id),
                    target: EntityRef::new(entity_type, d.target_id),
                    server_version: d.version,
                }
            }
        };
        Ok(Some(event))
    }

    /// Decodes an envelope, logging and skipping anything unusable.
    pub fn decode(&self, envelope: &EventEnvelope) -> Option<DomainEvent> {
        match self.try_decode(envelope) {
            Ok(Some(event)) => Some(event),
            Ok(None) => {
                debug!(event_type = %envelope.event_type, "ignoring unknown event type");
                None
            }
            Err(e) => {
                warn!(event_type = %envelope.event_type, error = %e, "skipping malformed event");
                None
            }
        }
    }

    /// Parses and decodes one raw record.
    pub fn decode_record(&self, record: &str) -> Option<DomainEvent> {
        match EventEnvelope::parse(record) {
            Ok(envelope) => self.decode(&envelope),
            Err(e) => {
                warn!(error = %e, "skipping unparseable record");
                None
            }
        }
    }
}
