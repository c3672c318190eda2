//! Server communication for the map editing core.
//!
//! This crate is the gateway between the synchronous store in
//! [`mapedit_core`] and the OSM editing API plus Overpass. It owns query
//! validation, the OSM JSON wire types, changeset assembly, and the HTTP
//! client that drives downloads and uploads.
//!
//! ## Responsibilities
//!
//! - Validate Overpass QL queries syntactically before any network use.
//! - Decode OSM JSON bodies into [`mapedit_core::EntitySet`] batches.
//! - Assemble pending local edits into one changeset document and fold
//!   the server's diff result back into the store.
//! - Normalize server base URLs and issue the HTTP requests.
//!
//! ## Boundaries
//!
//! - No store mutation beyond what [`mapedit_core::MapData`] exposes; the
//!   all-or-nothing merge and remap guarantees live there.
//! - No credential handling; authentication is the caller's concern.

#![forbid(unsafe_code)]

mod changeset;
mod client;
mod error;
mod overpass;
mod payload;

pub use changeset::{
    ChangesetDocument, DeletionStub, DiffEntry, DiffResult, UploadReceipt, build_changeset,
};
pub use client::{
    ClientBuildError, DEFAULT_OVERPASS_URL, DEFAULT_USER_AGENT, FetchRequest, OsmClient,
    OsmClientConfig, normalize_base_url,
};
pub use error::SyncError;
pub use overpass::{QueryError, validate_query};
pub use payload::{
    OsmElement, OsmPayload, PayloadMember, element_from_node, element_from_relation,
    element_from_way, parse_payload,
};
