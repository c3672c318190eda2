//! Error types for local graph mutation and undo/redo.

use thiserror::Error;

use crate::entity::{EntityId, EntityRef};

/// Errors returned by [`MapData`](crate::MapData) mutations and the undo
/// engine.
///
/// Every failing operation leaves the store untouched; none of these are
/// partially applied.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EditError {
    /// A coordinate or way shape violated a structural rule.
    #[error("invalid geometry: {reason}")]
    InvalidGeometry {
        /// Description of the violated rule.
        reason: String,
    },
    /// The referenced entity does not exist (or is tombstoned where a live
    /// entity is required).
    #[error("{reference} not found")]
    NotFound {
        /// The missing entity.
        reference: EntityRef,
    },
    /// Adding the member would let the relation reach itself through
    /// membership.
    #[error("adding {member} to relation {relation} would create a membership cycle")]
    CycleDetected {
        /// Relation the member was being added to.
        relation: EntityId,
        /// The rejected member.
        member: EntityRef,
    },
    /// The entity is still referenced by a live way or relation and the
    /// deletion did not request cascading.
    #[error("{reference} is still referenced by {referrer}")]
    EntityInUse {
        /// Entity whose deletion was rejected.
        reference: EntityRef,
        /// A live referrer (one of possibly several).
        referrer: EntityRef,
    },
    /// A placeholder-to-server identifier remap could not be applied as a
    /// whole. The store is unchanged.
    #[error("id remap is inconsistent: {reason}")]
    RemapInconsistent {
        /// Description of the first inconsistency found.
        reason: String,
    },
    /// The undo stack is empty.
    #[error("nothing to undo")]
    NothingToUndo,
    /// The redo stack is empty.
    #[error("nothing to redo")]
    NothingToRedo,
}
