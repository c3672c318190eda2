//! Placeholder identifier allocation.

use serde::{Deserialize, Serialize};

use crate::entity::{EntityId, EntityKind};

/// Issues locally unique placeholder identifiers, one descending counter
/// per entity kind starting at −1.
///
/// Server identifiers are always non-negative, so placeholders can never
/// collide with them. Counters are serialized with the store so a restored
/// session does not reuse identifiers already handed out; they are never
/// rolled back, not even by undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdAllocator {
    next_node: EntityId,
    next_way: EntityId,
    next_relation: EntityId,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self {
            next_node: -1,
            next_way: -1,
            next_relation: -1,
        }
    }
}

impl IdAllocator {
    /// Hand out the next placeholder identifier for `kind`.
    pub fn allocate(&mut self, kind: EntityKind) -> EntityId {
        let counter = match kind {
            EntityKind::Node => &mut self.next_node,
            EntityKind::Way => &mut self.next_way,
            EntityKind::Relation => &mut self.next_relation,
        };
        let id = *counter;
        *counter -= 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn counters_descend_independently_per_kind() {
        let mut allocator = IdAllocator::default();
        assert_eq!(allocator.allocate(EntityKind::Node), -1);
        assert_eq!(allocator.allocate(EntityKind::Node), -2);
        assert_eq!(allocator.allocate(EntityKind::Way), -1);
        assert_eq!(allocator.allocate(EntityKind::Relation), -1);
        assert_eq!(allocator.allocate(EntityKind::Node), -3);
    }

    #[rstest]
    fn allocated_ids_are_placeholders() {
        let mut allocator = IdAllocator::default();
        for _ in 0..16 {
            assert!(allocator.allocate(EntityKind::Way) < 0);
        }
    }
}
