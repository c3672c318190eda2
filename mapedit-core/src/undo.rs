//! The undo/redo engine.
//!
//! Every mutation on [`MapData`](crate::MapData) records a [`Change`]
//! carrying full before/after snapshots of the touched entity, so applying
//! the inverse is exact by construction. Changes are batched into
//! [`ChangeGroup`]s: one group per logical user action, undone and redone
//! as a unit.
//!
//! The manager is plain per-store state, never a process-wide singleton;
//! independent stores (for example, in tests) carry independent histories.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entity::{EntityId, Node, Relation, Tags, Way};

/// A single reversible mutation: before/after snapshots of one entity.
///
/// `None` marks "did not exist". Undo restores `before`; redo restores
/// `after`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    /// A node table entry changed.
    Node {
        /// Identifier the snapshots apply to.
        id: EntityId,
        /// State before the mutation.
        before: Option<Node>,
        /// State after the mutation.
        after: Option<Node>,
    },
    /// A way table entry changed.
    Way {
        /// Identifier the snapshots apply to.
        id: EntityId,
        /// State before the mutation.
        before: Option<Way>,
        /// State after the mutation.
        after: Option<Way>,
    },
    /// A relation table entry changed.
    Relation {
        /// Identifier the snapshots apply to.
        id: EntityId,
        /// State before the mutation.
        before: Option<Relation>,
        /// State after the mutation.
        after: Option<Relation>,
    },
}

/// The unit of undo: the changes of one logical user action, plus the
/// changeset comment and the context produced for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeGroup {
    /// Human-readable description of the action (changeset comment).
    pub comment: String,
    /// Opaque context the comment provider produced for this action.
    pub context: Tags,
    /// Recorded changes in application order.
    pub changes: Vec<Change>,
}

/// Maps a changeset comment to an opaque context attached to each group.
///
/// Supplied by the embedding application at store construction; the engine
/// attaches the result to every committed group and otherwise does not
/// interpret it.
pub type CommentContextProvider = Box<dyn Fn(&str) -> Tags + Send>;

/// Per-store undo/redo state: two stacks of committed groups plus the
/// currently open group, if any.
pub struct UndoManager {
    undo_stack: Vec<ChangeGroup>,
    redo_stack: Vec<ChangeGroup>,
    depth: usize,
    pending_comment: String,
    pending: Vec<Change>,
    context_for_comment: CommentContextProvider,
}

impl fmt::Debug for UndoManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoManager")
            .field("undo_depth", &self.undo_stack.len())
            .field("redo_depth", &self.redo_stack.len())
            .field("open_group", &(self.depth > 0))
            .finish_non_exhaustive()
    }
}

impl UndoManager {
    /// Construct an empty manager with the injected comment context
    /// provider.
    #[must_use]
    pub fn new(context_for_comment: CommentContextProvider) -> Self {
        Self {
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            depth: 0,
            pending_comment: String::new(),
            pending: Vec::new(),
            context_for_comment,
        }
    }

    /// Rebuild a manager from archived stacks.
    #[must_use]
    pub fn from_stacks(
        context_for_comment: CommentContextProvider,
        undo_stack: Vec<ChangeGroup>,
        redo_stack: Vec<ChangeGroup>,
    ) -> Self {
        Self {
            undo_stack,
            redo_stack,
            depth: 0,
            pending_comment: String::new(),
            pending: Vec::new(),
            context_for_comment,
        }
    }

    /// Open a group. Nested calls collapse into the outermost group; only
    /// the first call's comment is kept.
    pub fn begin_group(&mut self, comment: &str) {
        if self.depth == 0 {
            self.pending_comment = comment.to_owned();
            self.pending.clear();
        }
        self.depth += 1;
    }

    /// Close a group. Only the outermost close commits; a group that
    /// recorded nothing is discarded.
    pub fn end_group(&mut self) {
        if self.depth == 0 {
            return;
        }
        self.depth -= 1;
        if self.depth > 0 || self.pending.is_empty() {
            return;
        }
        let comment = std::mem::take(&mut self.pending_comment);
        let context = (self.context_for_comment)(&comment);
        let group = ChangeGroup {
            comment,
            context,
            changes: std::mem::take(&mut self.pending),
        };
        self.commit(group);
    }

    /// Whether a group is currently open.
    #[must_use]
    pub const fn in_group(&self) -> bool {
        self.depth > 0
    }

    /// Record one change. Inside an open group the change joins the group;
    /// outside, it commits immediately as a single-change group.
    ///
    /// Committing clears the redo stack: recording a new mutation forfeits
    /// any reverted groups (linear history, no branching redo).
    pub fn record(&mut self, change: Change, comment: &str) {
        if self.depth > 0 {
            self.pending.push(change);
            return;
        }
        let group = ChangeGroup {
            comment: comment.to_owned(),
            context: (self.context_for_comment)(comment),
            changes: vec![change],
        };
        self.commit(group);
    }

    fn commit(&mut self, group: ChangeGroup) {
        self.redo_stack.clear();
        self.undo_stack.push(group);
    }

    /// Pop the most recent applied group, if any.
    pub fn pop_undo(&mut self) -> Option<ChangeGroup> {
        self.undo_stack.pop()
    }

    /// Park a reverted group on the redo stack.
    pub fn push_redo(&mut self, group: ChangeGroup) {
        self.redo_stack.push(group);
    }

    /// Pop the most recently reverted group, if any.
    pub fn pop_redo(&mut self) -> Option<ChangeGroup> {
        self.redo_stack.pop()
    }

    /// Return a replayed group to the undo stack without clearing redo.
    pub fn push_undo(&mut self, group: ChangeGroup) {
        self.undo_stack.push(group);
    }

    /// Number of groups available to undo.
    #[must_use]
    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    /// Number of groups available to redo.
    #[must_use]
    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    /// Applied groups, oldest first.
    #[must_use]
    pub fn undo_history(&self) -> &[ChangeGroup] {
        &self.undo_stack
    }

    /// Reverted groups, oldest first.
    #[must_use]
    pub fn redo_history(&self) -> &[ChangeGroup] {
        &self.redo_stack
    }

    /// Drop both stacks. Used when a confirmed upload makes the recorded
    /// snapshots stale (their identifiers no longer exist).
    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::Coord;
    use rstest::{fixture, rstest};

    #[fixture]
    fn manager() -> UndoManager {
        UndoManager::new(Box::new(|_| Tags::new()))
    }

    fn node_change(id: EntityId) -> Change {
        let node = Node::new(id, Coord { x: 0.0, y: 0.0 }).unwrap();
        Change::Node {
            id,
            before: None,
            after: Some(node),
        }
    }

    #[rstest]
    fn single_change_commits_immediately(mut manager: UndoManager) {
        manager.record(node_change(-1), "add point");
        assert_eq!(manager.undo_depth(), 1);
        assert_eq!(manager.undo_history()[0].comment, "add point");
        assert_eq!(manager.undo_history()[0].changes.len(), 1);
    }

    #[rstest]
    fn nested_groups_collapse_to_outermost(mut manager: UndoManager) {
        manager.begin_group("outer");
        manager.record(node_change(-1), "ignored");
        manager.begin_group("inner");
        manager.record(node_change(-2), "ignored");
        manager.end_group();
        assert_eq!(manager.undo_depth(), 0, "inner end must not commit");
        manager.end_group();
        assert_eq!(manager.undo_depth(), 1);
        assert_eq!(manager.undo_history()[0].changes.len(), 2);
    }

    #[rstest]
    fn empty_group_is_discarded(mut manager: UndoManager) {
        manager.begin_group("noop");
        manager.end_group();
        assert_eq!(manager.undo_depth(), 0);
    }

    #[rstest]
    fn new_mutation_clears_redo(mut manager: UndoManager) {
        manager.record(node_change(-1), "first");
        let group = manager.pop_undo().unwrap();
        manager.push_redo(group);
        assert_eq!(manager.redo_depth(), 1);
        manager.record(node_change(-2), "second");
        assert_eq!(manager.redo_depth(), 0);
    }

    #[rstest]
    fn provider_context_is_attached_to_groups() {
        let mut manager = UndoManager::new(Box::new(|comment| {
            let mut context = Tags::new();
            context.insert("comment".to_owned(), comment.to_owned());
            context
        }));
        manager.record(node_change(-1), "move point");
        let context = &manager.undo_history()[0].context;
        assert_eq!(context.get("comment").map(String::as_str), Some("move point"));
    }
}
