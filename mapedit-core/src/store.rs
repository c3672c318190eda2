//! The entity graph store.
//!
//! [`MapData`] is the sole owner of all nodes, ways, and relations, keyed by
//! identifier in one table per kind. Every mutation is atomic — fully
//! applied or fully rejected — and records its inverse with the undo
//! manager before returning, so arbitrary edit sequences stay reversible
//! without ever leaving dangling references.

use std::collections::{BTreeMap, BTreeSet};

use geo::Coord;
use log::{debug, warn};

use crate::entity::{
    Entity, EntityId, EntityKind, EntityRef, Member, Node, Relation, RemoteInfo, Tags, Way,
    validate_location, validate_way_nodes,
};
use crate::error::EditError;
use crate::id::IdAllocator;
use crate::undo::{Change, ChangeGroup, CommentContextProvider, UndoManager};

/// A batch of entities parsed from a server response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntitySet {
    /// Downloaded nodes.
    pub nodes: Vec<Node>,
    /// Downloaded ways.
    pub ways: Vec<Way>,
    /// Downloaded relations.
    pub relations: Vec<Relation>,
}

impl EntitySet {
    /// Total number of entities in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len() + self.ways.len() + self.relations.len()
    }

    /// Whether the set contains no entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of merging a downloaded [`EntitySet`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    /// Number of entities inserted or updated.
    pub applied: usize,
    /// Entities left untouched because they carry local edits.
    pub skipped: Vec<EntityRef>,
}

/// Placeholder-to-server identifier assignments, one table per kind.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdRemap {
    /// Node placeholder → server id.
    pub nodes: BTreeMap<EntityId, EntityId>,
    /// Way placeholder → server id.
    pub ways: BTreeMap<EntityId, EntityId>,
    /// Relation placeholder → server id.
    pub relations: BTreeMap<EntityId, EntityId>,
}

impl IdRemap {
    /// Whether the remap contains no assignments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.ways.is_empty() && self.relations.is_empty()
    }
}

/// Everything the server confirmed for one uploaded changeset.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncConfirmation {
    /// Placeholder reassignments.
    pub remap: IdRemap,
    /// Changeset identifier the server wrote the edits under.
    pub changeset: i64,
    /// Confirmed versions, keyed by post-remap reference.
    pub versions: Vec<(EntityRef, u32)>,
    /// Tombstones the server confirmed as removed.
    pub deleted: Vec<EntityRef>,
}

/// Local edits awaiting upload, grouped by disposition.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PendingEdits {
    /// Placeholder entities never sent to the server.
    pub created: Vec<EntityRef>,
    /// Synchronized entities with local modifications.
    pub modified: Vec<EntityRef>,
    /// Tombstoned entities awaiting deletion confirmation.
    pub deleted: Vec<EntityRef>,
}

impl PendingEdits {
    /// Whether there is nothing to upload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// The entity graph store: three identifier-keyed tables, the placeholder
/// allocator, and the undo engine.
///
/// # Examples
///
/// ```
/// use geo::Coord;
/// use mapedit_core::{MapData, Tags};
///
/// # fn main() -> Result<(), mapedit_core::EditError> {
/// let mut map = MapData::new(Box::new(|_| Tags::new()));
/// let node = map.create_node(Coord { x: 13.4, y: 52.5 })?;
/// let way = map.create_way();
/// map.add_way_node(way, node, 0)?;
/// map.undo()?;
/// assert!(map.way(way).is_some_and(|w| w.nodes.is_empty()));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MapData {
    pub(crate) nodes: BTreeMap<EntityId, Node>,
    pub(crate) ways: BTreeMap<EntityId, Way>,
    pub(crate) relations: BTreeMap<EntityId, Relation>,
    pub(crate) allocator: IdAllocator,
    pub(crate) undo: UndoManager,
}

impl MapData {
    /// Construct an empty store.
    ///
    /// The comment context provider is a required collaborator: it maps a
    /// changeset comment to opaque context attached to each undo group.
    #[must_use]
    pub fn new(context_for_comment: CommentContextProvider) -> Self {
        Self {
            nodes: BTreeMap::new(),
            ways: BTreeMap::new(),
            relations: BTreeMap::new(),
            allocator: IdAllocator::default(),
            undo: UndoManager::new(context_for_comment),
        }
    }

    pub(crate) fn from_parts(
        nodes: BTreeMap<EntityId, Node>,
        ways: BTreeMap<EntityId, Way>,
        relations: BTreeMap<EntityId, Relation>,
        allocator: IdAllocator,
        undo: UndoManager,
    ) -> Self {
        Self {
            nodes,
            ways,
            relations,
            allocator,
            undo,
        }
    }

    // ---- read access -------------------------------------------------

    /// Node by identifier, tombstoned entries included.
    #[must_use]
    pub fn node(&self, id: EntityId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Way by identifier, tombstoned entries included.
    #[must_use]
    pub fn way(&self, id: EntityId) -> Option<&Way> {
        self.ways.get(&id)
    }

    /// Relation by identifier, tombstoned entries included.
    #[must_use]
    pub fn relation(&self, id: EntityId) -> Option<&Relation> {
        self.relations.get(&id)
    }

    /// Kind-generic lookup.
    #[must_use]
    pub fn entity(&self, reference: EntityRef) -> Option<Entity<'_>> {
        match reference.kind {
            EntityKind::Node => self.node(reference.id).map(Entity::Node),
            EntityKind::Way => self.way(reference.id).map(Entity::Way),
            EntityKind::Relation => self.relation(reference.id).map(Entity::Relation),
        }
    }

    /// All nodes, tombstoned entries included.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// All ways, tombstoned entries included.
    pub fn ways(&self) -> impl Iterator<Item = &Way> {
        self.ways.values()
    }

    /// All relations, tombstoned entries included.
    pub fn relations(&self) -> impl Iterator<Item = &Relation> {
        self.relations.values()
    }

    /// Number of node table entries.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of way table entries.
    #[must_use]
    pub fn way_count(&self) -> usize {
        self.ways.len()
    }

    /// Number of relation table entries.
    #[must_use]
    pub fn relation_count(&self) -> usize {
        self.relations.len()
    }

    /// Live ways and relations that reference `reference`.
    ///
    /// Back-references are derived on demand, never stored.
    #[must_use]
    pub fn referrers(&self, reference: EntityRef) -> Vec<EntityRef> {
        let mut out = Vec::new();
        if reference.kind == EntityKind::Node {
            for (id, way) in &self.ways {
                if !way.deleted && way.nodes.contains(&reference.id) {
                    out.push(EntityRef::way(*id));
                }
            }
        }
        for (id, relation) in &self.relations {
            if !relation.deleted
                && relation
                    .members
                    .iter()
                    .any(|member| member.reference == reference)
            {
                out.push(EntityRef::relation(*id));
            }
        }
        out
    }

    /// Local edits awaiting upload.
    #[must_use]
    pub fn pending_edits(&self) -> PendingEdits {
        let mut pending = PendingEdits::default();
        for entity in self
            .nodes
            .values()
            .map(|n| Entity::Node(n))
            .chain(self.ways.values().map(|w| Entity::Way(w)))
            .chain(self.relations.values().map(|r| Entity::Relation(r)))
        {
            let reference = entity.entity_ref();
            if entity.is_deleted() {
                pending.deleted.push(reference);
            } else if reference.is_placeholder() {
                pending.created.push(reference);
            } else if entity.is_modified() {
                pending.modified.push(reference);
            }
        }
        pending
    }

    /// Verify referential integrity: every live way and relation references
    /// only live entities, and no relation reaches itself.
    ///
    /// # Errors
    ///
    /// Returns the first violation found as [`EditError::NotFound`] or
    /// [`EditError::CycleDetected`].
    pub fn check_integrity(&self) -> Result<(), EditError> {
        for way in self.ways.values().filter(|w| !w.deleted) {
            for node_id in &way.nodes {
                if self.live_node(*node_id).is_err() {
                    return Err(EditError::NotFound {
                        reference: EntityRef::node(*node_id),
                    });
                }
            }
        }
        for relation in self.relations.values().filter(|r| !r.deleted) {
            for member in &relation.members {
                if self.live_entity_exists(member.reference).is_err() {
                    return Err(EditError::NotFound {
                        reference: member.reference,
                    });
                }
            }
            if self.relation_reaches(relation.id, relation.id, true) {
                return Err(EditError::CycleDetected {
                    relation: relation.id,
                    member: EntityRef::relation(relation.id),
                });
            }
        }
        Ok(())
    }

    // ---- undo groups -------------------------------------------------

    /// Open an undo group; all mutations until the matching
    /// [`end_group`](Self::end_group) undo and redo as one unit. Nested
    /// calls collapse into the outermost group.
    pub fn begin_group(&mut self, comment: &str) {
        self.undo.begin_group(comment);
    }

    /// Close the innermost open undo group.
    pub fn end_group(&mut self) {
        self.undo.end_group();
    }

    /// Number of groups available to undo.
    #[must_use]
    pub fn undo_depth(&self) -> usize {
        self.undo.undo_depth()
    }

    /// Number of groups available to redo.
    #[must_use]
    pub fn redo_depth(&self) -> usize {
        self.undo.redo_depth()
    }

    /// Revert the most recent group, applying each change's inverse in
    /// reverse order.
    ///
    /// # Errors
    ///
    /// [`EditError::NothingToUndo`] when the stack is empty or a group is
    /// still open.
    pub fn undo(&mut self) -> Result<(), EditError> {
        if self.undo.in_group() {
            return Err(EditError::NothingToUndo);
        }
        let group = self.undo.pop_undo().ok_or(EditError::NothingToUndo)?;
        for change in group.changes.iter().rev() {
            self.apply_snapshot(change, false);
        }
        self.undo.push_redo(group);
        Ok(())
    }

    /// Replay the most recently reverted group in its original order.
    ///
    /// # Errors
    ///
    /// [`EditError::NothingToRedo`] when the stack is empty or a group is
    /// still open.
    pub fn redo(&mut self) -> Result<(), EditError> {
        if self.undo.in_group() {
            return Err(EditError::NothingToRedo);
        }
        let group = self.undo.pop_redo().ok_or(EditError::NothingToRedo)?;
        for change in &group.changes {
            self.apply_snapshot(change, true);
        }
        self.undo.push_undo(group);
        Ok(())
    }

    // ---- mutations ---------------------------------------------------

    /// Create a node at `location` and return its placeholder identifier.
    ///
    /// # Errors
    ///
    /// [`EditError::InvalidGeometry`] for an invalid coordinate.
    pub fn create_node(&mut self, location: Coord<f64>) -> Result<EntityId, EditError> {
        validate_location(location)?;
        let id = self.allocator.allocate(EntityKind::Node);
        let node = Node::new(id, location)?;
        self.stage_node(id, None, Some(node), "create node");
        Ok(id)
    }

    /// Create an empty way and return its placeholder identifier.
    pub fn create_way(&mut self) -> EntityId {
        let id = self.allocator.allocate(EntityKind::Way);
        self.stage_way(id, None, Some(Way::new(id)), "create way");
        id
    }

    /// Create an empty relation and return its placeholder identifier.
    pub fn create_relation(&mut self) -> EntityId {
        let id = self.allocator.allocate(EntityKind::Relation);
        self.stage_relation(id, None, Some(Relation::new(id)), "create relation");
        id
    }

    /// Replace the tag mapping of a live entity.
    ///
    /// # Errors
    ///
    /// [`EditError::NotFound`] when the entity is absent or tombstoned.
    pub fn set_tags(&mut self, reference: EntityRef, tags: Tags) -> Result<(), EditError> {
        match reference.kind {
            EntityKind::Node => {
                let before = self.live_node(reference.id)?.clone();
                if before.tags == tags {
                    return Ok(());
                }
                let mut after = before.clone();
                after.tags = tags;
                after.modified = true;
                self.stage_node(reference.id, Some(before), Some(after), "edit tags");
            }
            EntityKind::Way => {
                let before = self.live_way(reference.id)?.clone();
                if before.tags == tags {
                    return Ok(());
                }
                let mut after = before.clone();
                after.tags = tags;
                after.modified = true;
                self.stage_way(reference.id, Some(before), Some(after), "edit tags");
            }
            EntityKind::Relation => {
                let before = self.live_relation(reference.id)?.clone();
                if before.tags == tags {
                    return Ok(());
                }
                let mut after = before.clone();
                after.tags = tags;
                after.modified = true;
                self.stage_relation(reference.id, Some(before), Some(after), "edit tags");
            }
        }
        Ok(())
    }

    /// Move a live node to a new coordinate.
    ///
    /// # Errors
    ///
    /// [`EditError::NotFound`] for an absent or tombstoned node,
    /// [`EditError::InvalidGeometry`] for an invalid coordinate.
    pub fn move_node(&mut self, id: EntityId, location: Coord<f64>) -> Result<(), EditError> {
        validate_location(location)?;
        let before = self.live_node(id)?.clone();
        if before.location == location {
            return Ok(());
        }
        let mut after = before.clone();
        after.location = location;
        after.modified = true;
        self.stage_node(id, Some(before), Some(after), "move node");
        Ok(())
    }

    /// Insert a node reference into a way at `index`.
    ///
    /// # Errors
    ///
    /// [`EditError::NotFound`] when either entity is absent or tombstoned;
    /// [`EditError::InvalidGeometry`] when the index is out of bounds or the
    /// insertion would duplicate a node other than closing the ring.
    pub fn add_way_node(
        &mut self,
        way_id: EntityId,
        node_id: EntityId,
        index: usize,
    ) -> Result<(), EditError> {
        let before = self.live_way(way_id)?.clone();
        self.live_node(node_id)?;
        if index > before.nodes.len() {
            return Err(EditError::InvalidGeometry {
                reason: format!(
                    "insert position {index} is beyond way length {}",
                    before.nodes.len()
                ),
            });
        }
        let mut after = before.clone();
        after.nodes.insert(index, node_id);
        validate_way_nodes(&after.nodes)?;
        after.modified = true;
        self.stage_way(way_id, Some(before), Some(after), "add node to way");
        Ok(())
    }

    /// Remove the node reference at `index` from a way.
    ///
    /// # Errors
    ///
    /// [`EditError::NotFound`] for an absent or tombstoned way,
    /// [`EditError::InvalidGeometry`] for an out-of-bounds index.
    pub fn remove_way_node(&mut self, way_id: EntityId, index: usize) -> Result<(), EditError> {
        let before = self.live_way(way_id)?.clone();
        if index >= before.nodes.len() {
            return Err(EditError::InvalidGeometry {
                reason: format!(
                    "remove position {index} is beyond way length {}",
                    before.nodes.len()
                ),
            });
        }
        let mut after = before.clone();
        after.nodes.remove(index);
        after.modified = true;
        self.stage_way(way_id, Some(before), Some(after), "remove node from way");
        Ok(())
    }

    /// Insert a member into a relation at `index`.
    ///
    /// # Errors
    ///
    /// [`EditError::NotFound`] when the relation or the member target is
    /// absent or tombstoned; [`EditError::CycleDetected`] when the member
    /// would let the relation reach itself; [`EditError::InvalidGeometry`]
    /// for an out-of-bounds index.
    pub fn add_member(
        &mut self,
        relation_id: EntityId,
        member: Member,
        index: usize,
    ) -> Result<(), EditError> {
        let before = self.live_relation(relation_id)?.clone();
        self.live_entity_exists(member.reference)?;
        if index > before.members.len() {
            return Err(EditError::InvalidGeometry {
                reason: format!(
                    "insert position {index} is beyond member count {}",
                    before.members.len()
                ),
            });
        }
        if member.reference.kind == EntityKind::Relation
            && self.relation_reaches(member.reference.id, relation_id, false)
        {
            return Err(EditError::CycleDetected {
                relation: relation_id,
                member: member.reference,
            });
        }
        let mut after = before.clone();
        after.members.insert(index, member);
        after.modified = true;
        self.stage_relation(relation_id, Some(before), Some(after), "add relation member");
        Ok(())
    }

    /// Remove the member at `index` from a relation.
    ///
    /// # Errors
    ///
    /// [`EditError::NotFound`] for an absent or tombstoned relation,
    /// [`EditError::InvalidGeometry`] for an out-of-bounds index.
    pub fn remove_member(&mut self, relation_id: EntityId, index: usize) -> Result<(), EditError> {
        let before = self.live_relation(relation_id)?.clone();
        if index >= before.members.len() {
            return Err(EditError::InvalidGeometry {
                reason: format!(
                    "remove position {index} is beyond member count {}",
                    before.members.len()
                ),
            });
        }
        let mut after = before.clone();
        after.members.remove(index);
        after.modified = true;
        self.stage_relation(
            relation_id,
            Some(before),
            Some(after),
            "remove relation member",
        );
        Ok(())
    }

    /// Delete an entity.
    ///
    /// Without `cascade`, a target still referenced by a live way or
    /// relation is rejected. With `cascade`, the referring entries are
    /// removed in the same undo group before the target is tombstoned.
    /// Placeholders that were never uploaded are removed outright;
    /// synchronized entities are tombstoned until the server confirms the
    /// deletion.
    ///
    /// # Errors
    ///
    /// [`EditError::NotFound`] for an absent or tombstoned target,
    /// [`EditError::EntityInUse`] when referenced and `cascade` is false.
    pub fn delete(&mut self, reference: EntityRef, cascade: bool) -> Result<(), EditError> {
        self.live_entity_exists(reference)?;
        let referrers = self.referrers(reference);
        if let Some(referrer) = referrers.first() {
            if !cascade {
                return Err(EditError::EntityInUse {
                    reference,
                    referrer: *referrer,
                });
            }
        }

        let comment = format!("delete {reference}");
        self.undo.begin_group(&comment);
        for referrer in referrers {
            match referrer.kind {
                EntityKind::Way => {
                    let before = self
                        .ways
                        .get(&referrer.id)
                        .cloned()
                        .unwrap_or_else(|| Way::new(referrer.id));
                    let mut after = before.clone();
                    after.nodes.retain(|id| *id != reference.id);
                    after.modified = true;
                    self.stage_way(referrer.id, Some(before), Some(after), &comment);
                }
                EntityKind::Relation => {
                    let before = self
                        .relations
                        .get(&referrer.id)
                        .cloned()
                        .unwrap_or_else(|| Relation::new(referrer.id));
                    let mut after = before.clone();
                    after.members.retain(|member| member.reference != reference);
                    after.modified = true;
                    self.stage_relation(referrer.id, Some(before), Some(after), &comment);
                }
                EntityKind::Node => {}
            }
        }
        match reference.kind {
            EntityKind::Node => {
                if let Some(before) = self.nodes.get(&reference.id).cloned() {
                    let after = tombstone(&before, reference.is_placeholder());
                    self.stage_node(reference.id, Some(before), after, &comment);
                }
            }
            EntityKind::Way => {
                if let Some(before) = self.ways.get(&reference.id).cloned() {
                    let after = tombstone(&before, reference.is_placeholder());
                    self.stage_way(reference.id, Some(before), after, &comment);
                }
            }
            EntityKind::Relation => {
                if let Some(before) = self.relations.get(&reference.id).cloned() {
                    let after = tombstone(&before, reference.is_placeholder());
                    self.stage_relation(reference.id, Some(before), after, &comment);
                }
            }
        }
        self.undo.end_group();
        Ok(())
    }

    /// Merge a downloaded [`EntitySet`] into the store.
    ///
    /// Entities are inserted or updated by server identifier. Entities with
    /// pending local edits are skipped, never overwritten; the skipped
    /// references are reported in the outcome. The merge is validated in
    /// full before anything is applied, and applies as one undo group.
    ///
    /// # Errors
    ///
    /// [`EditError::RemapInconsistent`] when the set contains placeholder
    /// identifiers, [`EditError::InvalidGeometry`] for invalid geometry,
    /// [`EditError::NotFound`] when a member reference would not resolve
    /// after the merge, and [`EditError::CycleDetected`] when the merged
    /// relations would form a membership cycle. The store is unchanged on
    /// any failure.
    pub fn merge_remote(&mut self, set: &EntitySet) -> Result<MergeOutcome, EditError> {
        let mut skipped = Vec::new();

        let apply_nodes: Vec<&Node> = set
            .nodes
            .iter()
            .filter(|node| self.keep_incoming(EntityRef::node(node.id), &mut skipped))
            .collect();
        let apply_ways: Vec<&Way> = set
            .ways
            .iter()
            .filter(|way| self.keep_incoming(EntityRef::way(way.id), &mut skipped))
            .collect();
        let apply_relations: Vec<&Relation> = set
            .relations
            .iter()
            .filter(|relation| self.keep_incoming(EntityRef::relation(relation.id), &mut skipped))
            .collect();

        self.validate_merge(&apply_nodes, &apply_ways, &apply_relations)?;

        self.undo.begin_group("merge remote data");
        let mut applied = 0;
        for node in apply_nodes {
            let before = self.nodes.get(&node.id).cloned();
            self.stage_node(node.id, before, Some(clean(node.clone())), "merge remote data");
            applied += 1;
        }
        for way in apply_ways {
            let before = self.ways.get(&way.id).cloned();
            self.stage_way(way.id, before, Some(clean(way.clone())), "merge remote data");
            applied += 1;
        }
        for relation in apply_relations {
            let before = self.relations.get(&relation.id).cloned();
            self.stage_relation(
                relation.id,
                before,
                Some(clean(relation.clone())),
                "merge remote data",
            );
            applied += 1;
        }
        self.undo.end_group();

        debug!(
            "merged {applied} remote entities, skipped {} with local edits",
            skipped.len()
        );
        Ok(MergeOutcome { applied, skipped })
    }

    /// Rebind placeholder identifiers to server-assigned ones.
    ///
    /// The whole remap is validated first; on success every entity is
    /// re-keyed and every way and relation member reference that pointed at
    /// a placeholder is rewritten, in one undo group.
    ///
    /// # Errors
    ///
    /// [`EditError::RemapInconsistent`] when any assignment is malformed,
    /// targets a missing placeholder, or collides with an existing
    /// identifier. The store is unchanged on failure.
    pub fn apply_id_map(&mut self, remap: &IdRemap) -> Result<(), EditError> {
        self.validate_remap(remap)?;
        if remap.is_empty() {
            return Ok(());
        }

        self.undo.begin_group("assign server identifiers");

        // Rewrite member references before re-keying, so snapshots pair the
        // reference rewrite with the table it applies to.
        let way_ids: Vec<EntityId> = self.ways.keys().copied().collect();
        for id in way_ids {
            let before = match self.ways.get(&id) {
                Some(way) => way.clone(),
                None => continue,
            };
            let rewritten: Vec<EntityId> = before
                .nodes
                .iter()
                .map(|node_id| remap.nodes.get(node_id).copied().unwrap_or(*node_id))
                .collect();
            if rewritten != before.nodes {
                let mut after = before.clone();
                after.nodes = rewritten;
                self.stage_way(id, Some(before), Some(after), "assign server identifiers");
            }
        }
        let relation_ids: Vec<EntityId> = self.relations.keys().copied().collect();
        for id in relation_ids {
            let before = match self.relations.get(&id) {
                Some(relation) => relation.clone(),
                None => continue,
            };
            let rewritten: Vec<Member> = before
                .members
                .iter()
                .map(|member| {
                    let table = match member.reference.kind {
                        EntityKind::Node => &remap.nodes,
                        EntityKind::Way => &remap.ways,
                        EntityKind::Relation => &remap.relations,
                    };
                    let id = table
                        .get(&member.reference.id)
                        .copied()
                        .unwrap_or(member.reference.id);
                    Member::new(
                        EntityRef {
                            kind: member.reference.kind,
                            id,
                        },
                        member.role.clone(),
                    )
                })
                .collect();
            if rewritten != before.members {
                let mut after = before.clone();
                after.members = rewritten;
                self.stage_relation(id, Some(before), Some(after), "assign server identifiers");
            }
        }

        for (old, new) in &remap.nodes {
            if let Some(mut node) = self.nodes.get(old).cloned() {
                self.stage_node(*old, Some(node.clone()), None, "assign server identifiers");
                node.id = *new;
                self.stage_node(*new, None, Some(node), "assign server identifiers");
            }
        }
        for (old, new) in &remap.ways {
            if let Some(mut way) = self.ways.get(old).cloned() {
                self.stage_way(*old, Some(way.clone()), None, "assign server identifiers");
                way.id = *new;
                self.stage_way(*new, None, Some(way), "assign server identifiers");
            }
        }
        for (old, new) in &remap.relations {
            if let Some(mut relation) = self.relations.get(old).cloned() {
                self.stage_relation(
                    *old,
                    Some(relation.clone()),
                    None,
                    "assign server identifiers",
                );
                relation.id = *new;
                self.stage_relation(*new, None, Some(relation), "assign server identifiers");
            }
        }

        self.undo.end_group();
        Ok(())
    }

    /// Apply everything a successful upload confirmed: the identifier
    /// remap, the confirmed versions and changeset, and the removal of
    /// confirmed tombstones. Clears the undo history afterwards — the
    /// confirmed state is a new baseline and the recorded snapshots would
    /// reference retired placeholder identifiers.
    ///
    /// # Errors
    ///
    /// [`EditError::RemapInconsistent`] from remap validation; nothing is
    /// applied in that case.
    pub fn confirm_sync(&mut self, confirmation: &SyncConfirmation) -> Result<(), EditError> {
        self.apply_id_map(&confirmation.remap)?;

        for (reference, version) in &confirmation.versions {
            let remote = RemoteInfo {
                version: *version,
                changeset: confirmation.changeset,
            };
            let found = match reference.kind {
                EntityKind::Node => self.nodes.get_mut(&reference.id).map(|node| {
                    node.remote = Some(remote);
                    node.modified = false;
                }),
                EntityKind::Way => self.ways.get_mut(&reference.id).map(|way| {
                    way.remote = Some(remote);
                    way.modified = false;
                }),
                EntityKind::Relation => self.relations.get_mut(&reference.id).map(|relation| {
                    relation.remote = Some(remote);
                    relation.modified = false;
                }),
            };
            if found.is_none() {
                warn!("server confirmed {reference}, which is not in the store");
            }
        }

        for reference in &confirmation.deleted {
            let removed = match reference.kind {
                EntityKind::Node => self.nodes.remove(&reference.id).is_some(),
                EntityKind::Way => self.ways.remove(&reference.id).is_some(),
                EntityKind::Relation => self.relations.remove(&reference.id).is_some(),
            };
            if !removed {
                warn!("server confirmed deletion of {reference}, which is not in the store");
            }
        }

        self.undo.clear();
        debug!(
            "confirmed changeset {}: {} versions, {} deletions",
            confirmation.changeset,
            confirmation.versions.len(),
            confirmation.deleted.len()
        );
        Ok(())
    }

    // ---- internals ---------------------------------------------------

    fn live_node(&self, id: EntityId) -> Result<&Node, EditError> {
        self.nodes
            .get(&id)
            .filter(|node| !node.deleted)
            .ok_or(EditError::NotFound {
                reference: EntityRef::node(id),
            })
    }

    fn live_way(&self, id: EntityId) -> Result<&Way, EditError> {
        self.ways
            .get(&id)
            .filter(|way| !way.deleted)
            .ok_or(EditError::NotFound {
                reference: EntityRef::way(id),
            })
    }

    fn live_relation(&self, id: EntityId) -> Result<&Relation, EditError> {
        self.relations
            .get(&id)
            .filter(|relation| !relation.deleted)
            .ok_or(EditError::NotFound {
                reference: EntityRef::relation(id),
            })
    }

    fn live_entity_exists(&self, reference: EntityRef) -> Result<(), EditError> {
        match reference.kind {
            EntityKind::Node => self.live_node(reference.id).map(|_| ()),
            EntityKind::Way => self.live_way(reference.id).map(|_| ()),
            EntityKind::Relation => self.live_relation(reference.id).map(|_| ()),
        }
    }

    /// Whether `start` can reach `target` by following live relation
    /// members. With `skip_start` the search ignores the trivial
    /// zero-length path, for self-cycle checks.
    fn relation_reaches(&self, start: EntityId, target: EntityId, skip_start: bool) -> bool {
        let mut stack = if skip_start {
            self.relation_member_ids(start)
        } else {
            vec![start]
        };
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == target {
                return true;
            }
            if seen.insert(id) {
                stack.extend(self.relation_member_ids(id));
            }
        }
        false
    }

    fn relation_member_ids(&self, id: EntityId) -> Vec<EntityId> {
        self.relations
            .get(&id)
            .filter(|relation| !relation.deleted)
            .map(|relation| {
                relation
                    .members
                    .iter()
                    .filter(|member| member.reference.kind == EntityKind::Relation)
                    .map(|member| member.reference.id)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn keep_incoming(&self, reference: EntityRef, skipped: &mut Vec<EntityRef>) -> bool {
        let locally_edited = self
            .entity(reference)
            .is_some_and(|entity| entity.is_modified() || entity.is_deleted());
        if locally_edited {
            skipped.push(reference);
        }
        !locally_edited
    }

    fn validate_merge(
        &self,
        nodes: &[&Node],
        ways: &[&Way],
        relations: &[&Relation],
    ) -> Result<(), EditError> {
        for node in nodes {
            if node.id < 0 {
                return Err(EditError::RemapInconsistent {
                    reason: format!("downloaded node {} has a placeholder identifier", node.id),
                });
            }
            validate_location(node.location)?;
        }
        for way in ways {
            if way.id < 0 {
                return Err(EditError::RemapInconsistent {
                    reason: format!("downloaded way {} has a placeholder identifier", way.id),
                });
            }
            validate_way_nodes(&way.nodes)?;
        }
        for relation in relations {
            if relation.id < 0 {
                return Err(EditError::RemapInconsistent {
                    reason: format!(
                        "downloaded relation {} has a placeholder identifier",
                        relation.id
                    ),
                });
            }
        }

        // Resolvability against the post-merge view: a reference resolves if
        // the set provides it or a live local entity already has it.
        let incoming_nodes: BTreeSet<EntityId> = nodes.iter().map(|n| n.id).collect();
        let incoming_ways: BTreeSet<EntityId> = ways.iter().map(|w| w.id).collect();
        let incoming_relations: BTreeSet<EntityId> = relations.iter().map(|r| r.id).collect();
        let resolves = |reference: EntityRef| -> bool {
            let incoming = match reference.kind {
                EntityKind::Node => incoming_nodes.contains(&reference.id),
                EntityKind::Way => incoming_ways.contains(&reference.id),
                EntityKind::Relation => incoming_relations.contains(&reference.id),
            };
            incoming || self.live_entity_exists(reference).is_ok()
        };
        for way in ways {
            for node_id in &way.nodes {
                if !resolves(EntityRef::node(*node_id)) {
                    return Err(EditError::NotFound {
                        reference: EntityRef::node(*node_id),
                    });
                }
            }
        }
        for relation in relations {
            for member in &relation.members {
                if !resolves(member.reference) {
                    return Err(EditError::NotFound {
                        reference: member.reference,
                    });
                }
            }
        }

        // Cycle check over the post-merge membership graph.
        let mut membership: BTreeMap<EntityId, Vec<EntityId>> = self
            .relations
            .iter()
            .filter(|(_, relation)| !relation.deleted)
            .map(|(id, relation)| {
                (
                    *id,
                    relation
                        .members
                        .iter()
                        .filter(|member| member.reference.kind == EntityKind::Relation)
                        .map(|member| member.reference.id)
                        .collect(),
                )
            })
            .collect();
        for relation in relations {
            membership.insert(
                relation.id,
                relation
                    .members
                    .iter()
                    .filter(|member| member.reference.kind == EntityKind::Relation)
                    .map(|member| member.reference.id)
                    .collect(),
            );
        }
        for relation in relations {
            let mut stack: Vec<EntityId> = membership
                .get(&relation.id)
                .cloned()
                .unwrap_or_default();
            let mut seen = BTreeSet::new();
            while let Some(id) = stack.pop() {
                if id == relation.id {
                    return Err(EditError::CycleDetected {
                        relation: relation.id,
                        member: EntityRef::relation(id),
                    });
                }
                if seen.insert(id) {
                    if let Some(children) = membership.get(&id) {
                        stack.extend(children.iter().copied());
                    }
                }
            }
        }

        Ok(())
    }

    fn validate_remap(&self, remap: &IdRemap) -> Result<(), EditError> {
        validate_remap_table(&remap.nodes, EntityKind::Node, &self.nodes)?;
        validate_remap_table(&remap.ways, EntityKind::Way, &self.ways)?;
        validate_remap_table(&remap.relations, EntityKind::Relation, &self.relations)?;
        Ok(())
    }

    fn apply_snapshot(&mut self, change: &Change, forward: bool) {
        match change {
            Change::Node { id, before, after } => {
                let state = if forward { after } else { before };
                match state.clone() {
                    Some(node) => self.nodes.insert(*id, node),
                    None => self.nodes.remove(id),
                };
            }
            Change::Way { id, before, after } => {
                let state = if forward { after } else { before };
                match state.clone() {
                    Some(way) => self.ways.insert(*id, way),
                    None => self.ways.remove(id),
                };
            }
            Change::Relation { id, before, after } => {
                let state = if forward { after } else { before };
                match state.clone() {
                    Some(relation) => self.relations.insert(*id, relation),
                    None => self.relations.remove(id),
                };
            }
        }
    }

    fn stage_node(
        &mut self,
        id: EntityId,
        before: Option<Node>,
        after: Option<Node>,
        comment: &str,
    ) {
        self.undo.record(
            Change::Node {
                id,
                before,
                after: after.clone(),
            },
            comment,
        );
        match after {
            Some(node) => {
                self.nodes.insert(id, node);
            }
            None => {
                self.nodes.remove(&id);
            }
        }
    }

    fn stage_way(&mut self, id: EntityId, before: Option<Way>, after: Option<Way>, comment: &str) {
        self.undo.record(
            Change::Way {
                id,
                before,
                after: after.clone(),
            },
            comment,
        );
        match after {
            Some(way) => {
                self.ways.insert(id, way);
            }
            None => {
                self.ways.remove(&id);
            }
        }
    }

    fn stage_relation(
        &mut self,
        id: EntityId,
        before: Option<Relation>,
        after: Option<Relation>,
        comment: &str,
    ) {
        self.undo.record(
            Change::Relation {
                id,
                before,
                after: after.clone(),
            },
            comment,
        );
        match after {
            Some(relation) => {
                self.relations.insert(id, relation);
            }
            None => {
                self.relations.remove(&id);
            }
        }
    }

    pub(crate) fn undo_stacks(&self) -> (&[ChangeGroup], &[ChangeGroup]) {
        (self.undo.undo_history(), self.undo.redo_history())
    }
}

/// Tombstoned successor state for a deletion: placeholders vanish outright,
/// synchronized entities stay addressable until the server confirms.
fn tombstone<T: EntityFlags + Clone>(before: &T, placeholder: bool) -> Option<T> {
    if placeholder {
        None
    } else {
        let mut next = before.clone();
        next.set_flags(true, true);
        Some(next)
    }
}

fn validate_remap_table<T>(
    table: &BTreeMap<EntityId, EntityId>,
    kind: EntityKind,
    entities: &BTreeMap<EntityId, T>,
) -> Result<(), EditError> {
    let mut assigned = BTreeSet::new();
    for (old, new) in table {
        if *old >= 0 {
            return Err(EditError::RemapInconsistent {
                reason: format!("remap source {kind} {old} is not a placeholder"),
            });
        }
        if *new < 0 {
            return Err(EditError::RemapInconsistent {
                reason: format!("remap target {kind} {new} is not a server identifier"),
            });
        }
        if !entities.contains_key(old) {
            return Err(EditError::RemapInconsistent {
                reason: format!("placeholder {kind} {old} is not in the store"),
            });
        }
        if entities.contains_key(new) {
            return Err(EditError::RemapInconsistent {
                reason: format!("server id {kind} {new} already exists in the store"),
            });
        }
        if !assigned.insert(*new) {
            return Err(EditError::RemapInconsistent {
                reason: format!("server id {kind} {new} assigned to more than one placeholder"),
            });
        }
    }
    Ok(())
}

/// Incoming server entities carry no local edit state.
fn clean<T: EntityFlags>(mut entity: T) -> T {
    entity.set_flags(false, false);
    entity
}

trait EntityFlags {
    fn set_flags(&mut self, deleted: bool, modified: bool);
}

impl EntityFlags for Node {
    fn set_flags(&mut self, deleted: bool, modified: bool) {
        self.deleted = deleted;
        self.modified = modified;
    }
}

impl EntityFlags for Way {
    fn set_flags(&mut self, deleted: bool, modified: bool) {
        self.deleted = deleted;
        self.modified = modified;
    }
}

impl EntityFlags for Relation {
    fn set_flags(&mut self, deleted: bool, modified: bool) {
        self.deleted = deleted;
        self.modified = modified;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    fn coordinate(lon: f64, lat: f64) -> Coord<f64> {
        Coord { x: lon, y: lat }
    }

    #[fixture]
    fn map() -> MapData {
        MapData::new(Box::new(|_| Tags::new()))
    }

    #[rstest]
    fn create_node_allocates_descending_placeholders(mut map: MapData) {
        let first = map.create_node(coordinate(0.0, 0.0)).unwrap();
        let second = map.create_node(coordinate(1.0, 1.0)).unwrap();
        assert_eq!(first, -1);
        assert_eq!(second, -2);
        assert!(map.node(first).is_some());
    }

    #[rstest]
    fn set_tags_requires_live_entity(mut map: MapData) {
        let mut tags = Tags::new();
        tags.insert("highway".into(), "residential".into());
        let result = map.set_tags(EntityRef::way(99), tags);
        assert_eq!(
            result,
            Err(EditError::NotFound {
                reference: EntityRef::way(99)
            })
        );
    }

    #[rstest]
    fn add_way_node_rejects_missing_node(mut map: MapData) {
        let way = map.create_way();
        let result = map.add_way_node(way, -5, 0);
        assert_eq!(
            result,
            Err(EditError::NotFound {
                reference: EntityRef::node(-5)
            })
        );
    }

    #[rstest]
    fn way_accepts_closing_duplicate_only(mut map: MapData) {
        let a = map.create_node(coordinate(0.0, 0.0)).unwrap();
        let b = map.create_node(coordinate(1.0, 0.0)).unwrap();
        let c = map.create_node(coordinate(1.0, 1.0)).unwrap();
        let way = map.create_way();
        map.add_way_node(way, a, 0).unwrap();
        map.add_way_node(way, b, 1).unwrap();

        // Interior duplicate rejected.
        assert!(matches!(
            map.add_way_node(way, a, 1),
            Err(EditError::InvalidGeometry { .. })
        ));

        map.add_way_node(way, c, 2).unwrap();
        map.add_way_node(way, a, 3).unwrap();
        assert!(map.way(way).unwrap().is_closed());
    }

    #[rstest]
    fn membership_cycles_are_rejected(mut map: MapData) {
        let r1 = map.create_relation();
        let r2 = map.create_relation();
        map.add_member(r1, Member::new(EntityRef::relation(r2), "child"), 0)
            .unwrap();
        let before_r1 = map.relation(r1).unwrap().clone();
        let before_r2 = map.relation(r2).unwrap().clone();

        let result = map.add_member(r2, Member::new(EntityRef::relation(r1), "child"), 0);
        assert_eq!(
            result,
            Err(EditError::CycleDetected {
                relation: r2,
                member: EntityRef::relation(r1),
            })
        );
        assert_eq!(map.relation(r1).unwrap(), &before_r1);
        assert_eq!(map.relation(r2).unwrap(), &before_r2);
    }

    #[rstest]
    fn self_membership_is_rejected(mut map: MapData) {
        let relation = map.create_relation();
        let result = map.add_member(relation, Member::new(EntityRef::relation(relation), ""), 0);
        assert!(matches!(result, Err(EditError::CycleDetected { .. })));
    }

    #[rstest]
    fn delete_without_cascade_fails_when_referenced(mut map: MapData) {
        let node = map.create_node(coordinate(0.0, 0.0)).unwrap();
        let way = map.create_way();
        map.add_way_node(way, node, 0).unwrap();
        let before = map.way(way).unwrap().clone();

        let result = map.delete(EntityRef::node(node), false);
        assert_eq!(
            result,
            Err(EditError::EntityInUse {
                reference: EntityRef::node(node),
                referrer: EntityRef::way(way),
            })
        );
        assert_eq!(map.way(way).unwrap(), &before);
        assert!(map.node(node).is_some());
    }

    #[rstest]
    fn cascading_delete_detaches_referrers(mut map: MapData) {
        let node = map.create_node(coordinate(0.0, 0.0)).unwrap();
        let other = map.create_node(coordinate(1.0, 0.0)).unwrap();
        let way = map.create_way();
        map.add_way_node(way, node, 0).unwrap();
        map.add_way_node(way, other, 1).unwrap();

        map.delete(EntityRef::node(node), true).unwrap();
        assert!(map.node(node).is_none(), "placeholder removed outright");
        assert_eq!(map.way(way).unwrap().nodes, vec![other]);
        map.check_integrity().unwrap();
    }

    #[rstest]
    fn deleting_synchronized_entity_leaves_tombstone(mut map: MapData) {
        let set = EntitySet {
            nodes: vec![remote_node(7, 0.0, 0.0)],
            ..EntitySet::default()
        };
        map.merge_remote(&set).unwrap();
        map.delete(EntityRef::node(7), false).unwrap();
        let node = map.node(7).unwrap();
        assert!(node.deleted);
        assert!(node.modified);
        assert_eq!(map.pending_edits().deleted, vec![EntityRef::node(7)]);
    }

    #[rstest]
    fn merge_skips_locally_modified_entities(mut map: MapData) {
        let set = EntitySet {
            nodes: vec![remote_node(7, 0.0, 0.0)],
            ..EntitySet::default()
        };
        map.merge_remote(&set).unwrap();
        let mut tags = Tags::new();
        tags.insert("name".into(), "local".into());
        map.set_tags(EntityRef::node(7), tags.clone()).unwrap();

        let update = EntitySet {
            nodes: vec![remote_node(7, 5.0, 5.0)],
            ..EntitySet::default()
        };
        let outcome = map.merge_remote(&update).unwrap();
        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.skipped, vec![EntityRef::node(7)]);
        assert_eq!(map.node(7).unwrap().tags, tags);
    }

    #[rstest]
    fn merge_rejects_unresolvable_way_reference(mut map: MapData) {
        let mut way = Way::new(3);
        way.nodes = vec![99];
        let set = EntitySet {
            ways: vec![way],
            ..EntitySet::default()
        };
        let result = map.merge_remote(&set);
        assert_eq!(
            result,
            Err(EditError::NotFound {
                reference: EntityRef::node(99)
            })
        );
        assert_eq!(map.way_count(), 0, "failed merge must not apply anything");
    }

    #[rstest]
    fn remap_rewrites_way_references_atomically(mut map: MapData) {
        let node = map.create_node(coordinate(0.0, 0.0)).unwrap();
        let way = map.create_way();
        map.add_way_node(way, node, 0).unwrap();

        let mut remap = IdRemap::default();
        remap.nodes.insert(node, 42);
        map.apply_id_map(&remap).unwrap();

        assert!(map.node(node).is_none());
        assert_eq!(map.node(42).unwrap().id, 42);
        assert_eq!(map.way(way).unwrap().nodes, vec![42]);
        assert!(map.referrers(EntityRef::node(node)).is_empty());
        map.check_integrity().unwrap();
    }

    #[rstest]
    fn remap_collision_leaves_store_unchanged(mut map: MapData) {
        let set = EntitySet {
            nodes: vec![remote_node(42, 1.0, 1.0)],
            ..EntitySet::default()
        };
        map.merge_remote(&set).unwrap();
        let node = map.create_node(coordinate(0.0, 0.0)).unwrap();

        let mut remap = IdRemap::default();
        remap.nodes.insert(node, 42);
        let result = map.apply_id_map(&remap);
        assert!(matches!(result, Err(EditError::RemapInconsistent { .. })));
        assert!(map.node(node).is_some());
        assert_eq!(map.node(42).unwrap().location, coordinate(1.0, 1.0));
    }

    #[rstest]
    fn undo_then_redo_round_trips(mut map: MapData) {
        let node = map.create_node(coordinate(0.0, 0.0)).unwrap();
        map.begin_group("build way");
        let way = map.create_way();
        map.add_way_node(way, node, 0).unwrap();
        map.end_group();

        let before = (map.node(node).cloned(), map.way(way).cloned());
        map.undo().unwrap();
        assert!(map.way(way).is_none(), "group reverts as a unit");
        map.redo().unwrap();
        assert_eq!((map.node(node).cloned(), map.way(way).cloned()), before);
    }

    #[rstest]
    fn undo_underflow_is_reported(mut map: MapData) {
        assert_eq!(map.undo(), Err(EditError::NothingToUndo));
        assert_eq!(map.redo(), Err(EditError::NothingToRedo));
    }

    #[rstest]
    fn new_mutation_discards_redo_history(mut map: MapData) {
        map.create_node(coordinate(0.0, 0.0)).unwrap();
        map.undo().unwrap();
        assert_eq!(map.redo_depth(), 1);
        map.create_node(coordinate(1.0, 1.0)).unwrap();
        assert_eq!(map.redo_depth(), 0);
        assert_eq!(map.redo(), Err(EditError::NothingToRedo));
    }

    #[rstest]
    fn confirm_sync_sets_versions_and_drops_tombstones(mut map: MapData) {
        let set = EntitySet {
            nodes: vec![remote_node(7, 0.0, 0.0)],
            ..EntitySet::default()
        };
        map.merge_remote(&set).unwrap();
        map.delete(EntityRef::node(7), false).unwrap();
        let created = map.create_node(coordinate(2.0, 2.0)).unwrap();

        let mut confirmation = SyncConfirmation {
            changeset: 900,
            ..SyncConfirmation::default()
        };
        confirmation.remap.nodes.insert(created, 10);
        confirmation.versions.push((EntityRef::node(10), 1));
        confirmation.deleted.push(EntityRef::node(7));
        map.confirm_sync(&confirmation).unwrap();

        assert!(map.node(7).is_none());
        let node = map.node(10).unwrap();
        assert_eq!(node.remote, Some(RemoteInfo { version: 1, changeset: 900 }));
        assert!(!node.modified);
        assert_eq!(map.undo_depth(), 0, "confirmed upload resets history");
        assert!(map.pending_edits().is_empty());
    }

    fn remote_node(id: EntityId, lon: f64, lat: f64) -> Node {
        let mut node = Node::new(id, coordinate(lon, lat)).unwrap();
        node.remote = Some(RemoteInfo {
            version: 1,
            changeset: 1,
        });
        node
    }
}
