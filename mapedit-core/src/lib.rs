//! Core editing model for OpenStreetMap-style data.
//!
//! Responsibilities:
//! - Own the entity graph (nodes, ways, relations) and enforce its
//!   referential invariants under arbitrary edit sequences.
//! - Record every mutation with the undo engine so heterogeneous
//!   multi-entity edits revert and replay exactly.
//! - Persist and restore the whole store, allocator counters and undo
//!   history included, through a versioned archive.
//!
//! Boundaries:
//! - No networking; server payload parsing and synchronization live in
//!   `mapedit-sync`, which drives [`MapData::merge_remote`] and
//!   [`MapData::confirm_sync`].
//! - No rendering or gesture handling; display layers consume the read
//!   accessors only.

#![forbid(unsafe_code)]

mod archive;
mod entity;
mod error;
mod id;
mod store;
mod undo;

pub use archive::{ArchiveError, FORMAT_VERSION, from_bytes, read_archive, to_bytes, write_archive};
pub use entity::{
    Entity, EntityId, EntityKind, EntityRef, Member, Node, Relation, RemoteInfo, Tags, Way,
    validate_location, validate_way_nodes,
};
pub use error::EditError;
pub use id::IdAllocator;
pub use store::{EntitySet, IdRemap, MapData, MergeOutcome, PendingEdits, SyncConfirmation};
pub use undo::{Change, ChangeGroup, CommentContextProvider, UndoManager};
