//! Entity identifiers and snapshots.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Prefix marking an identifier minted on this device before the server
/// has assigned one.
pub const TEMPORARY_ID_PREFIX: &str = "local-";

/// Field name → JSON value, ordered so diffs and payloads are stable.
pub type FieldMap = BTreeMap<String, serde_json::Value>;

/// The kinds of library entities the engine synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// An audiobook.
    Book,
    /// An author or narrator.
    Contributor,
    /// A named series of books.
    Series,
    /// A user tag.
    Tag,
    /// A genre.
    Genre,
}

impl EntityType {
    /// All entity types, in wire order.
    pub const ALL: [EntityType; 5] = [
        EntityType::Book,
        EntityType::Contributor,
        EntityType::Series,
        EntityType::Tag,
        EntityType::Genre,
    ];

    /// Returns the wire name used in event tags and REST paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Book => "book",
            EntityType::Contributor => "contributor",
            EntityType::Series => "series",
            EntityType::Tag => "tag",
            EntityType::Genre => "genre",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or(())
    }
}

/// Identifier of an entity, either server-assigned or temporary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Wraps a server-assigned identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mints a fresh temporary identifier for an entity created offline.
    pub fn temporary() -> Self {
        Self(format!("{TEMPORARY_ID_PREFIX}{}", Uuid::new_v4()))
    }

    /// Returns true if the server has not yet assigned this entity an id.
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMPORARY_ID_PREFIX)
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A typed pointer to one entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    /// The entity type.
    pub entity_type: EntityType,
    /// The entity id.
    pub id: EntityId,
}

impl EntityRef {
    /// Creates a new entity reference.
    pub fn new(entity_type: EntityType, id: impl Into<EntityId>) -> Self {
        Self {
            entity_type,
            id: id.into(),
        }
    }

    /// Shorthand for a book reference.
    pub fn book(id: impl Into<EntityId>) -> Self {
        Self::new(EntityType::Book, id)
    }

    /// Shorthand for a contributor reference.
    pub fn contributor(id: impl Into<EntityId>) -> Self {
        Self::new(EntityType::Contributor, id)
    }

    /// Returns the same reference pointing at another id.
    pub fn with_id(&self, id: EntityId) -> Self {
        Self {
            entity_type: self.entity_type,
            id,
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.id)
    }
}

/// Collection-like relations owned by a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relation {
    /// Authors of the book.
    Authors,
    /// Narrators of the book.
    Narrators,
    /// Series the book belongs to, with its position in each.
    Series,
    /// User tags.
    Tags,
    /// Genres.
    Genres,
}

impl Relation {
    /// All relations, in wire order.
    pub const ALL: [Relation; 5] = [
        Relation::Authors,
        Relation::Narrators,
        Relation::Series,
        Relation::Tags,
        Relation::Genres,
    ];

    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Relation::Authors => "authors",
            Relation::Narrators => "narrators",
            Relation::Series => "series",
            Relation::Tags => "tags",
            Relation::Genres => "genres",
        }
    }

    /// The entity type of the relation's members.
    pub fn member_type(&self) -> EntityType {
        match self {
            Relation::Authors | Relation::Narrators => EntityType::Contributor,
            Relation::Series => EntityType::Series,
            Relation::Tags => EntityType::Tag,
            Relation::Genres => EntityType::Genre,
        }
    }
}

impl fmt::Display for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Relation {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Relation::ALL.into_iter().find(|r| r.as_str() == s).ok_or(())
    }
}

/// One member of a relation set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationMember {
    /// Id of the member entity.
    pub id: EntityId,
    /// Position within a series ("1", "2.5"); `None` outside series.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<String>,
}

impl RelationMember {
    /// Creates an unordered member.
    pub fn new(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            sequence: None,
        }
    }

    /// Creates a series member at the given position.
    pub fn in_sequence(id: impl Into<EntityId>, sequence: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sequence: Some(sequence.into()),
        }
    }
}

/// Server-observed state of one entity as carried by create/update events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// Which entity.
    pub entity: EntityRef,
    /// Server revision counter.
    pub server_version: u64,
    /// Scalar fields carried by the event.
    #[serde(default)]
    pub fields: FieldMap,
    /// Relation sets carried by the event; absent relations are untouched.
    #[serde(default)]
    pub relations: BTreeMap<Relation, Vec<RelationMember>>,
}

impl EntitySnapshot {
    /// Creates a snapshot with no fields or relations.
    pub fn new(entity: EntityRef, server_version: u64) -> Self {
        Self {
            entity,
            server_version,
            fields: FieldMap::new(),
            relations: BTreeMap::new(),
        }
    }

    /// Adds a field, builder style.
    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Adds a relation set, builder style.
    pub fn with_relation(mut self, relation: Relation, members: Vec<RelationMember>) -> Self {
        self.relations.insert(relation, members);
        self
    }
}
