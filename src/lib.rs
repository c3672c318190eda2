//! Facade crate for the mapedit editing core.
//!
//! This crate re-exports the entity graph store, undo engine, and archive
//! from [`mapedit_core`] alongside the server client and Overpass query
//! validation from [`mapedit_sync`], so applications can depend on a single
//! crate.

#![forbid(unsafe_code)]

pub use mapedit_core::{
    ArchiveError, Change, ChangeGroup, EditError, Entity, EntityId, EntityKind, EntityRef,
    EntitySet, IdAllocator, IdRemap, MapData, Member, MergeOutcome, Node, PendingEdits, Relation,
    RemoteInfo, SyncConfirmation, Tags, Way, read_archive, write_archive,
};

pub use mapedit_sync::{
    FetchRequest, OsmClient, OsmClientConfig, QueryError, SyncError, UploadReceipt,
    normalize_base_url, validate_query,
};
