//! Wire types for the OSM JSON interchange format.
//!
//! Both the map server's `map.json` endpoint and Overpass (with
//! `[out:json]`) answer with a flat `elements` array of kind-tagged
//! objects. This module deserialises that shape and converts it into the
//! store's entity types, and builds the same shape for changeset uploads.
//!
//! See: <https://wiki.openstreetmap.org/wiki/OSM_JSON>

use geo::Coord;
use mapedit_core::{
    EntityKind, EntityRef, EntitySet, Member, Node, Relation, RemoteInfo, Tags, Way,
};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;

fn default_version() -> u32 {
    1
}

/// Top-level OSM JSON document.
#[derive(Debug, Deserialize)]
pub struct OsmPayload {
    /// Kind-tagged entities, in server order.
    pub elements: Vec<OsmElement>,
}

/// One element of an OSM JSON document.
///
/// `version` and `changeset` are optional in Overpass output (they only
/// appear with `out meta`); absent values default to version 1, changeset 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OsmElement {
    /// A point element.
    Node {
        /// Server identifier.
        id: i64,
        /// Latitude in degrees.
        lat: f64,
        /// Longitude in degrees.
        lon: f64,
        /// Tag mapping; omitted when empty.
        #[serde(default, skip_serializing_if = "Tags::is_empty")]
        tags: Tags,
        /// Server version counter.
        #[serde(default = "default_version")]
        version: u32,
        /// Changeset the element was last written in.
        #[serde(default)]
        changeset: i64,
    },
    /// An ordered sequence of node references.
    Way {
        /// Server identifier.
        id: i64,
        /// Ordered node identifiers.
        nodes: Vec<i64>,
        /// Tag mapping; omitted when empty.
        #[serde(default, skip_serializing_if = "Tags::is_empty")]
        tags: Tags,
        /// Server version counter.
        #[serde(default = "default_version")]
        version: u32,
        /// Changeset the element was last written in.
        #[serde(default)]
        changeset: i64,
    },
    /// A typed grouping of other elements.
    Relation {
        /// Server identifier.
        id: i64,
        /// Ordered members.
        members: Vec<PayloadMember>,
        /// Tag mapping; omitted when empty.
        #[serde(default, skip_serializing_if = "Tags::is_empty")]
        tags: Tags,
        /// Server version counter.
        #[serde(default = "default_version")]
        version: u32,
        /// Changeset the element was last written in.
        #[serde(default)]
        changeset: i64,
    },
}

/// A relation member on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadMember {
    /// Kind of the referenced element.
    #[serde(rename = "type", with = "kind_repr")]
    pub kind: EntityKind,
    /// Identifier of the referenced element.
    #[serde(rename = "ref")]
    pub reference: i64,
    /// Role of the member; empty for untyped membership.
    #[serde(default)]
    pub role: String,
}

pub(crate) mod kind_repr {
    use mapedit_core::EntityKind;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(kind: &EntityKind, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&kind.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<EntityKind, D::Error> {
        let text = String::deserialize(de)?;
        match text.as_str() {
            "node" => Ok(EntityKind::Node),
            "way" => Ok(EntityKind::Way),
            "relation" => Ok(EntityKind::Relation),
            other => Err(de::Error::custom(format!("unknown member type `{other}`"))),
        }
    }
}

/// Parse an OSM JSON body into an [`EntitySet`] ready for merging.
///
/// Downloaded entities are marked clean, carry [`RemoteInfo`] from the
/// wire metadata, and have their coordinates validated.
///
/// # Errors
///
/// - [`SyncError::Parse`] when the body is not valid OSM JSON.
/// - [`SyncError::Merge`] when an element carries an invalid coordinate.
pub fn parse_payload(body: &str) -> Result<EntitySet, SyncError> {
    let payload: OsmPayload = serde_json::from_str(body).map_err(|err| SyncError::Parse {
        message: err.to_string(),
    })?;

    let mut set = EntitySet::default();
    for element in payload.elements {
        match element {
            OsmElement::Node {
                id,
                lat,
                lon,
                tags,
                version,
                changeset,
            } => {
                let mut node = Node::new(id, Coord { x: lon, y: lat })?;
                node.tags = tags;
                node.remote = Some(RemoteInfo { version, changeset });
                set.nodes.push(node);
            }
            OsmElement::Way {
                id,
                nodes,
                tags,
                version,
                changeset,
            } => {
                let mut way = Way::new(id);
                way.nodes = nodes;
                way.tags = tags;
                way.remote = Some(RemoteInfo { version, changeset });
                set.ways.push(way);
            }
            OsmElement::Relation {
                id,
                members,
                tags,
                version,
                changeset,
            } => {
                let mut relation = Relation::new(id);
                relation.members = members
                    .into_iter()
                    .map(|member| {
                        Member::new(
                            EntityRef {
                                kind: member.kind,
                                id: member.reference,
                            },
                            member.role,
                        )
                    })
                    .collect();
                relation.tags = tags;
                relation.remote = Some(RemoteInfo { version, changeset });
                set.relations.push(relation);
            }
        }
    }
    Ok(set)
}

/// Wire representation of a local node, for upload.
#[must_use]
pub fn element_from_node(node: &Node) -> OsmElement {
    OsmElement::Node {
        id: node.id,
        lat: node.location.y,
        lon: node.location.x,
        tags: node.tags.clone(),
        version: node.remote.map_or_else(default_version, |r| r.version),
        changeset: node.remote.map_or(0, |r| r.changeset),
    }
}

/// Wire representation of a local way, for upload.
#[must_use]
pub fn element_from_way(way: &Way) -> OsmElement {
    OsmElement::Way {
        id: way.id,
        nodes: way.nodes.clone(),
        tags: way.tags.clone(),
        version: way.remote.map_or_else(default_version, |r| r.version),
        changeset: way.remote.map_or(0, |r| r.changeset),
    }
}

/// Wire representation of a local relation, for upload.
#[must_use]
pub fn element_from_relation(relation: &Relation) -> OsmElement {
    OsmElement::Relation {
        id: relation.id,
        members: relation
            .members
            .iter()
            .map(|member| PayloadMember {
                kind: member.reference.kind,
                reference: member.reference.id,
                role: member.role.clone(),
            })
            .collect(),
        tags: relation.tags.clone(),
        version: relation.remote.map_or_else(default_version, |r| r.version),
        changeset: relation.remote.map_or(0, |r| r.changeset),
    }
}
