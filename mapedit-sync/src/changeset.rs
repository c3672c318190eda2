//! Changeset assembly and upload-result interpretation.
//!
//! A changeset gathers every pending local edit into one upload document.
//! The server answers with a diff result that names, per uploaded entity,
//! the identifier and version it ended up with; [`DiffResult::into_confirmation`]
//! folds that answer into the [`SyncConfirmation`] the store applies
//! atomically.

use mapedit_core::{Entity, EntityKind, EntityRef, IdRemap, MapData, SyncConfirmation};
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::payload::{
    OsmElement, element_from_node, element_from_relation, element_from_way, kind_repr,
};

/// A deletion request: identifier plus the version being deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionStub {
    /// Kind of the entity to delete.
    #[serde(rename = "type", with = "kind_repr")]
    pub kind: EntityKind,
    /// Server identifier.
    pub id: i64,
    /// Version the client last saw; the server rejects stale deletes.
    pub version: u32,
}

/// Upload document covering every pending local edit.
#[derive(Debug, Clone, Serialize)]
pub struct ChangesetDocument {
    /// Operator-facing description of the edit session.
    pub comment: String,
    /// Placeholder entities, uploaded with their negative identifiers.
    pub created: Vec<OsmElement>,
    /// Synchronized entities with local changes.
    pub modified: Vec<OsmElement>,
    /// Tombstones awaiting server-side removal.
    pub deleted: Vec<DeletionStub>,
}

impl ChangesetDocument {
    /// Whether the document carries no edits at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

fn wire_element(entity: &Entity<'_>) -> OsmElement {
    match entity {
        Entity::Node(node) => element_from_node(node),
        Entity::Way(way) => element_from_way(way),
        Entity::Relation(relation) => element_from_relation(relation),
    }
}

/// Assemble the upload document for every pending edit in `map`.
#[must_use]
pub fn build_changeset(map: &MapData, comment: &str) -> ChangesetDocument {
    let pending = map.pending_edits();
    let resolve = |references: &[EntityRef]| -> Vec<OsmElement> {
        references
            .iter()
            .filter_map(|reference| map.entity(*reference))
            .map(|entity| wire_element(&entity))
            .collect()
    };
    let deleted = pending
        .deleted
        .iter()
        .filter_map(|reference| map.entity(*reference))
        .map(|entity| DeletionStub {
            kind: entity.kind(),
            id: entity.id(),
            version: entity.remote().map_or(1, |r| r.version),
        })
        .collect();
    ChangesetDocument {
        comment: comment.to_owned(),
        created: resolve(&pending.created),
        modified: resolve(&pending.modified),
        deleted,
    }
}

/// One line of the server's upload answer.
#[derive(Debug, Clone, Deserialize)]
pub struct DiffEntry {
    /// Kind of the uploaded entity.
    #[serde(rename = "type", with = "kind_repr")]
    pub kind: EntityKind,
    /// Identifier the client uploaded (negative for placeholders).
    pub old_id: i64,
    /// Server-assigned identifier; absent for deletions.
    #[serde(default)]
    pub new_id: Option<i64>,
    /// Post-upload version; absent for deletions.
    #[serde(default)]
    pub new_version: Option<u32>,
}

/// The server's answer to a changeset upload.
#[derive(Debug, Clone, Deserialize)]
pub struct DiffResult {
    /// Changeset the server wrote the edits under.
    pub changeset: i64,
    /// Per-entity outcomes.
    pub results: Vec<DiffEntry>,
}

impl DiffResult {
    /// Interpret the diff into the confirmation the store applies.
    ///
    /// Placeholder identifiers that received a server identifier land in
    /// the remap; surviving entities get their confirmed versions; entries
    /// with neither a new identifier nor a new version are deletions.
    ///
    /// # Errors
    ///
    /// [`SyncError::Parse`] when a placeholder entry lacks a server
    /// identifier, which would leave the local entity unreachable.
    pub fn into_confirmation(self) -> Result<SyncConfirmation, SyncError> {
        let mut remap = IdRemap::default();
        let mut versions = Vec::new();
        let mut deleted = Vec::new();
        for entry in self.results {
            match (entry.new_id, entry.new_version) {
                (new_id, Some(version)) => {
                    let id = new_id.unwrap_or(entry.old_id);
                    if entry.old_id < 0 {
                        let table = match entry.kind {
                            EntityKind::Node => &mut remap.nodes,
                            EntityKind::Way => &mut remap.ways,
                            EntityKind::Relation => &mut remap.relations,
                        };
                        table.insert(entry.old_id, id);
                    }
                    versions.push((EntityRef { kind: entry.kind, id }, version));
                }
                (None, None) => {
                    deleted.push(EntityRef {
                        kind: entry.kind,
                        id: entry.old_id,
                    });
                }
                (Some(_), None) => {
                    return Err(SyncError::Parse {
                        message: format!(
                            "diff entry for {} {} has an identifier but no version",
                            entry.kind, entry.old_id
                        ),
                    });
                }
            }
        }
        for (kind, table) in [
            (EntityKind::Node, &remap.nodes),
            (EntityKind::Way, &remap.ways),
            (EntityKind::Relation, &remap.relations),
        ] {
            if let Some((placeholder, _)) = table.iter().find(|(_, new_id)| **new_id < 0) {
                return Err(SyncError::Parse {
                    message: format!(
                        "server left placeholder {kind} {placeholder} unassigned"
                    ),
                });
            }
        }
        Ok(SyncConfirmation {
            remap,
            changeset: self.changeset,
            versions,
            deleted,
        })
    }
}

/// Summary of a completed upload, for callers and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadReceipt {
    /// Changeset the server wrote the edits under.
    pub changeset: i64,
    /// Entities created on the server.
    pub created: usize,
    /// Entities updated on the server.
    pub modified: usize,
    /// Entities removed on the server.
    pub deleted: usize,
}
