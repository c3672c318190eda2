//! The OSM entity model: nodes, ways, and relations.
//!
//! Entities never hold owning references to each other. Ways and relations
//! carry weak references ([`EntityId`] / [`EntityRef`]) that are resolved
//! through the owning [`MapData`](crate::MapData) store at use time, so the
//! membership graph can never form an ownership cycle.

use std::collections::BTreeMap;
use std::fmt;

use geo::Coord;
use serde::{Deserialize, Serialize};

use crate::error::EditError;

/// Signed entity identifier.
///
/// Negative values are locally allocated placeholders; non-negative values
/// are assigned by the server. Identifiers are unique per [`EntityKind`].
pub type EntityId = i64;

/// OSM-style tag mapping.
///
/// Ordered so that serialized output is deterministic, which the archive
/// round-trip property relies on.
pub type Tags = BTreeMap<String, String>;

/// The closed set of entity kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum EntityKind {
    /// A point with a coordinate.
    Node,
    /// An ordered sequence of node references.
    Way,
    /// A typed grouping of nodes, ways, and other relations.
    Relation,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node => f.write_str("node"),
            Self::Way => f.write_str("way"),
            Self::Relation => f.write_str("relation"),
        }
    }
}

/// Weak reference to an entity: kind plus identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EntityRef {
    /// Kind of the referenced entity.
    pub kind: EntityKind,
    /// Identifier of the referenced entity within its kind.
    pub id: EntityId,
}

impl EntityRef {
    /// Reference to a node.
    #[must_use]
    pub const fn node(id: EntityId) -> Self {
        Self {
            kind: EntityKind::Node,
            id,
        }
    }

    /// Reference to a way.
    #[must_use]
    pub const fn way(id: EntityId) -> Self {
        Self {
            kind: EntityKind::Way,
            id,
        }
    }

    /// Reference to a relation.
    #[must_use]
    pub const fn relation(id: EntityId) -> Self {
        Self {
            kind: EntityKind::Relation,
            id,
        }
    }

    /// Whether the referenced identifier is a locally allocated placeholder.
    #[must_use]
    pub const fn is_placeholder(&self) -> bool {
        self.id < 0
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// Server-side metadata attached once an entity has been synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInfo {
    /// Version counter maintained by the server.
    pub version: u32,
    /// Changeset the entity was last written in.
    pub changeset: i64,
}

/// Validate a WGS84 coordinate (`x` = longitude, `y` = latitude).
///
/// # Errors
///
/// Returns [`EditError::InvalidGeometry`] when either component is
/// non-finite or outside the ±180 / ±90 bounds.
pub fn validate_location(location: Coord<f64>) -> Result<(), EditError> {
    let valid = location.x.is_finite()
        && location.y.is_finite()
        && (-180.0..=180.0).contains(&location.x)
        && (-90.0..=90.0).contains(&location.y);
    if valid {
        Ok(())
    } else {
        Err(EditError::InvalidGeometry {
            reason: format!(
                "coordinate ({}, {}) is outside WGS84 bounds",
                location.x, location.y
            ),
        })
    }
}

/// A point entity with a geographic coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Identifier, unique among nodes.
    pub id: EntityId,
    /// Tag mapping.
    pub tags: Tags,
    /// WGS84 position (`x` = longitude, `y` = latitude). Always valid.
    pub location: Coord<f64>,
    /// Server metadata; `None` for purely local entities.
    pub remote: Option<RemoteInfo>,
    /// Whether the entity has local edits not yet uploaded.
    pub modified: bool,
    /// Tombstone flag; set when a deletion is pending upload.
    pub deleted: bool,
}

impl Node {
    /// Validate the coordinate and construct a local node.
    ///
    /// # Errors
    ///
    /// Returns [`EditError::InvalidGeometry`] for an out-of-bounds or
    /// non-finite coordinate.
    pub fn new(id: EntityId, location: Coord<f64>) -> Result<Self, EditError> {
        validate_location(location)?;
        Ok(Self {
            id,
            tags: Tags::new(),
            location,
            remote: None,
            modified: false,
            deleted: false,
        })
    }

    /// Weak reference to this node.
    #[must_use]
    pub const fn entity_ref(&self) -> EntityRef {
        EntityRef::node(self.id)
    }
}

/// An ordered sequence of node references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Way {
    /// Identifier, unique among ways.
    pub id: EntityId,
    /// Tag mapping.
    pub tags: Tags,
    /// Ordered node identifiers. The only permitted duplicate is
    /// `first == last`, expressing a closed ring.
    pub nodes: Vec<EntityId>,
    /// Server metadata; `None` for purely local entities.
    pub remote: Option<RemoteInfo>,
    /// Whether the entity has local edits not yet uploaded.
    pub modified: bool,
    /// Tombstone flag; set when a deletion is pending upload.
    pub deleted: bool,
}

impl Way {
    /// Construct an empty local way.
    #[must_use]
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            tags: Tags::new(),
            nodes: Vec::new(),
            remote: None,
            modified: false,
            deleted: false,
        }
    }

    /// Weak reference to this way.
    #[must_use]
    pub const fn entity_ref(&self) -> EntityRef {
        EntityRef::way(self.id)
    }

    /// Whether the way forms a closed ring (first node == last node).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.nodes.len() > 2 && self.nodes.first() == self.nodes.last()
    }
}

/// Validate a way's node list: every identifier unique, except that the
/// first may be repeated as the last to close a ring.
///
/// # Errors
///
/// Returns [`EditError::InvalidGeometry`] naming the offending node when a
/// non-closing duplicate is present.
pub fn validate_way_nodes(nodes: &[EntityId]) -> Result<(), EditError> {
    let interior = if nodes.len() > 2 && nodes.first() == nodes.last() {
        &nodes[..nodes.len() - 1]
    } else {
        nodes
    };
    let mut seen = std::collections::BTreeSet::new();
    for id in interior {
        if !seen.insert(*id) {
            return Err(EditError::InvalidGeometry {
                reason: format!("node {id} appears more than once in the way"),
            });
        }
    }
    Ok(())
}

/// One member of a relation: a weak reference plus a role string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Referenced entity.
    pub reference: EntityRef,
    /// Role of the member within the relation (may be empty).
    pub role: String,
}

impl Member {
    /// Construct a member.
    #[must_use]
    pub fn new(reference: EntityRef, role: impl Into<String>) -> Self {
        Self {
            reference,
            role: role.into(),
        }
    }
}

/// A typed grouping of nodes, ways, and other relations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    /// Identifier, unique among relations.
    pub id: EntityId,
    /// Tag mapping.
    pub tags: Tags,
    /// Ordered members. No relation may reach itself through membership.
    pub members: Vec<Member>,
    /// Server metadata; `None` for purely local entities.
    pub remote: Option<RemoteInfo>,
    /// Whether the entity has local edits not yet uploaded.
    pub modified: bool,
    /// Tombstone flag; set when a deletion is pending upload.
    pub deleted: bool,
}

impl Relation {
    /// Construct an empty local relation.
    #[must_use]
    pub fn new(id: EntityId) -> Self {
        Self {
            id,
            tags: Tags::new(),
            members: Vec::new(),
            remote: None,
            modified: false,
            deleted: false,
        }
    }

    /// Weak reference to this relation.
    #[must_use]
    pub const fn entity_ref(&self) -> EntityRef {
        EntityRef::relation(self.id)
    }
}

/// Borrowed, kind-tagged view over the three concrete entity types.
///
/// Useful for code that treats entities uniformly, such as integrity checks
/// and changeset assembly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Entity<'a> {
    /// A node.
    Node(&'a Node),
    /// A way.
    Way(&'a Way),
    /// A relation.
    Relation(&'a Relation),
}

impl<'a> Entity<'a> {
    /// Identifier of the underlying entity.
    #[must_use]
    pub const fn id(&self) -> EntityId {
        match self {
            Self::Node(n) => n.id,
            Self::Way(w) => w.id,
            Self::Relation(r) => r.id,
        }
    }

    /// Kind of the underlying entity.
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        match self {
            Self::Node(_) => EntityKind::Node,
            Self::Way(_) => EntityKind::Way,
            Self::Relation(_) => EntityKind::Relation,
        }
    }

    /// Weak reference to the underlying entity.
    #[must_use]
    pub const fn entity_ref(&self) -> EntityRef {
        EntityRef {
            kind: self.kind(),
            id: self.id(),
        }
    }

    /// Tags of the underlying entity.
    #[must_use]
    pub fn tags(&self) -> &'a Tags {
        match self {
            Self::Node(n) => &n.tags,
            Self::Way(w) => &w.tags,
            Self::Relation(r) => &r.tags,
        }
    }

    /// Whether the entity is tombstoned.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        match self {
            Self::Node(n) => n.deleted,
            Self::Way(w) => w.deleted,
            Self::Relation(r) => r.deleted,
        }
    }

    /// Whether the entity carries local edits not yet uploaded.
    #[must_use]
    pub const fn is_modified(&self) -> bool {
        match self {
            Self::Node(n) => n.modified,
            Self::Way(w) => w.modified,
            Self::Relation(r) => r.modified,
        }
    }

    /// Server metadata, when synchronized.
    #[must_use]
    pub const fn remote(&self) -> Option<RemoteInfo> {
        match self {
            Self::Node(n) => n.remote,
            Self::Way(w) => w.remote,
            Self::Relation(r) => r.remote,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0.0, 0.0)]
    #[case(-180.0, -90.0)]
    #[case(180.0, 90.0)]
    fn accepts_boundary_coordinates(#[case] lon: f64, #[case] lat: f64) {
        assert!(Node::new(-1, Coord { x: lon, y: lat }).is_ok());
    }

    #[rstest]
    #[case(-180.1, 0.0)]
    #[case(180.1, 0.0)]
    #[case(0.0, 90.1)]
    #[case(f64::NAN, 0.0)]
    #[case(0.0, f64::INFINITY)]
    fn rejects_out_of_bounds_coordinates(#[case] lon: f64, #[case] lat: f64) {
        let result = Node::new(-1, Coord { x: lon, y: lat });
        assert!(matches!(result, Err(EditError::InvalidGeometry { .. })));
    }

    #[rstest]
    #[case(&[], false)]
    #[case(&[1, 2], false)]
    #[case(&[1, 2, 3, 1], true)]
    fn detects_closed_rings(#[case] nodes: &[EntityId], #[case] closed: bool) {
        let mut way = Way::new(-1);
        way.nodes = nodes.to_vec();
        assert_eq!(way.is_closed(), closed);
    }

    #[rstest]
    fn closing_duplicate_is_permitted() {
        assert!(validate_way_nodes(&[1, 2, 3, 1]).is_ok());
    }

    #[rstest]
    #[case(&[1, 1])]
    #[case(&[1, 2, 2, 3])]
    #[case(&[1, 2, 1, 3, 1])]
    fn interior_duplicates_are_rejected(#[case] nodes: &[EntityId]) {
        assert!(matches!(
            validate_way_nodes(nodes),
            Err(EditError::InvalidGeometry { .. })
        ));
    }

    #[rstest]
    fn entity_ref_display_names_kind_and_id() {
        assert_eq!(EntityRef::node(-3).to_string(), "node -3");
        assert_eq!(EntityRef::relation(12).to_string(), "relation 12");
    }
}
