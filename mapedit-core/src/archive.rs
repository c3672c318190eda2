//! Versioned persistence for the whole store.
//!
//! The archive is an explicit schema, not an object-graph encoding: a
//! four-byte magic, a big-endian `u16` format version, then a bincode body
//! holding the three entity tables, the allocator counters, and both undo
//! stacks. Everything that makes up store state round-trips byte-for-byte,
//! which the tests compare directly.
//!
//! Loading is all-or-nothing: a malformed envelope or body fails without
//! producing a store. The comment context provider is a live collaborator,
//! not data, so it is re-injected by the caller on load.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entity::{EntityId, Node, Relation, Way};
use crate::id::IdAllocator;
use crate::store::MapData;
use crate::undo::{ChangeGroup, CommentContextProvider, UndoManager};

const MAGIC: [u8; 4] = *b"MPED";

/// Archive format version written by this build.
pub const FORMAT_VERSION: u16 = 1;

/// Errors raised while writing or loading an archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Reading or writing the underlying stream failed.
    #[error("archive I/O failed: {source}")]
    Io {
        /// Underlying stream error.
        #[from]
        source: std::io::Error,
    },
    /// Encoding the store failed.
    #[error("failed to encode archive: {source}")]
    Encode {
        /// Underlying encoder error.
        source: bincode::Error,
    },
    /// The input is not a valid archive. Nothing was loaded.
    #[error("archive is corrupt: {reason}")]
    CorruptData {
        /// Description of the first defect found.
        reason: String,
    },
    /// The archive was written by an incompatible format version.
    #[error("unsupported archive format version {found} (this build reads {FORMAT_VERSION})")]
    UnsupportedVersion {
        /// Version tag found in the envelope.
        found: u16,
    },
}

#[derive(Serialize)]
struct DocumentRef<'a> {
    nodes: &'a BTreeMap<EntityId, Node>,
    ways: &'a BTreeMap<EntityId, Way>,
    relations: &'a BTreeMap<EntityId, Relation>,
    allocator: &'a IdAllocator,
    undo_stack: &'a [ChangeGroup],
    redo_stack: &'a [ChangeGroup],
}

#[derive(Deserialize)]
struct Document {
    nodes: BTreeMap<EntityId, Node>,
    ways: BTreeMap<EntityId, Way>,
    relations: BTreeMap<EntityId, Relation>,
    allocator: IdAllocator,
    undo_stack: Vec<ChangeGroup>,
    redo_stack: Vec<ChangeGroup>,
}

/// Serialize the store into a byte vector.
///
/// # Errors
///
/// [`ArchiveError::Encode`] when the body cannot be encoded.
pub fn to_bytes(map: &MapData) -> Result<Vec<u8>, ArchiveError> {
    let (undo_stack, redo_stack) = map.undo_stacks();
    let document = DocumentRef {
        nodes: &map.nodes,
        ways: &map.ways,
        relations: &map.relations,
        allocator: &map.allocator,
        undo_stack,
        redo_stack,
    };
    let body = bincode::serialize(&document).map_err(|source| ArchiveError::Encode { source })?;
    let mut bytes = Vec::with_capacity(MAGIC.len() + 2 + body.len());
    bytes.extend_from_slice(&MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Write the store to `writer` as a versioned archive.
///
/// # Errors
///
/// [`ArchiveError::Encode`] or [`ArchiveError::Io`].
pub fn write_archive<W: Write>(map: &MapData, mut writer: W) -> Result<(), ArchiveError> {
    let bytes = to_bytes(map)?;
    writer.write_all(&bytes)?;
    Ok(())
}

/// Rebuild a store from archive bytes, re-injecting the comment context
/// provider.
///
/// # Errors
///
/// [`ArchiveError::CorruptData`] for a bad envelope or body,
/// [`ArchiveError::UnsupportedVersion`] for an unknown format version.
pub fn from_bytes(
    bytes: &[u8],
    context_for_comment: CommentContextProvider,
) -> Result<MapData, ArchiveError> {
    let header_len = MAGIC.len() + 2;
    if bytes.len() < header_len {
        return Err(ArchiveError::CorruptData {
            reason: format!("archive is {} bytes, shorter than the envelope", bytes.len()),
        });
    }
    if bytes[..MAGIC.len()] != MAGIC {
        return Err(ArchiveError::CorruptData {
            reason: "magic bytes do not match".to_owned(),
        });
    }
    let found = u16::from_be_bytes([bytes[MAGIC.len()], bytes[MAGIC.len() + 1]]);
    if found != FORMAT_VERSION {
        return Err(ArchiveError::UnsupportedVersion { found });
    }
    let document: Document = bincode::deserialize(&bytes[header_len..]).map_err(|source| {
        ArchiveError::CorruptData {
            reason: source.to_string(),
        }
    })?;
    Ok(MapData::from_parts(
        document.nodes,
        document.ways,
        document.relations,
        document.allocator,
        UndoManager::from_stacks(
            context_for_comment,
            document.undo_stack,
            document.redo_stack,
        ),
    ))
}

/// Read a versioned archive from `reader` and rebuild the store.
///
/// # Errors
///
/// [`ArchiveError::Io`], [`ArchiveError::CorruptData`], or
/// [`ArchiveError::UnsupportedVersion`].
pub fn read_archive<R: Read>(
    mut reader: R,
    context_for_comment: CommentContextProvider,
) -> Result<MapData, ArchiveError> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    from_bytes(&bytes, context_for_comment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Tags;
    use geo::Coord;
    use rstest::{fixture, rstest};

    fn provider() -> CommentContextProvider {
        Box::new(|_| Tags::new())
    }

    #[fixture]
    fn edited_map() -> MapData {
        let mut map = MapData::new(provider());
        let node = map.create_node(Coord { x: 13.4, y: 52.5 }).unwrap();
        let way = map.create_way();
        map.add_way_node(way, node, 0).unwrap();
        map.undo().unwrap();
        map
    }

    #[rstest]
    fn round_trip_is_byte_identical(edited_map: MapData) {
        let bytes = to_bytes(&edited_map).unwrap();
        let restored = from_bytes(&bytes, provider()).unwrap();
        assert_eq!(to_bytes(&restored).unwrap(), bytes);
    }

    #[rstest]
    fn round_trip_preserves_allocator_counters(edited_map: MapData) {
        let bytes = to_bytes(&edited_map).unwrap();
        let mut restored = from_bytes(&bytes, provider()).unwrap();
        // One node and one way were allocated before saving.
        assert_eq!(restored.create_node(Coord { x: 0.0, y: 0.0 }).unwrap(), -2);
        assert_eq!(restored.create_way(), -2);
    }

    #[rstest]
    fn round_trip_preserves_undo_history(edited_map: MapData) {
        let bytes = to_bytes(&edited_map).unwrap();
        let mut restored = from_bytes(&bytes, provider()).unwrap();
        assert_eq!(restored.undo_depth(), 2);
        assert_eq!(restored.redo_depth(), 1);
        restored.redo().unwrap();
        assert!(restored.way(-1).is_some_and(|way| way.nodes == vec![-1]));
    }

    #[rstest]
    fn bad_magic_is_corrupt(edited_map: MapData) {
        let mut bytes = to_bytes(&edited_map).unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            from_bytes(&bytes, provider()),
            Err(ArchiveError::CorruptData { .. })
        ));
    }

    #[rstest]
    fn truncated_body_is_corrupt(edited_map: MapData) {
        let bytes = to_bytes(&edited_map).unwrap();
        let truncated = &bytes[..bytes.len() - 3];
        assert!(matches!(
            from_bytes(truncated, provider()),
            Err(ArchiveError::CorruptData { .. })
        ));
    }

    #[rstest]
    fn future_version_is_unsupported(edited_map: MapData) {
        let mut bytes = to_bytes(&edited_map).unwrap();
        bytes[4] = 0xff;
        assert!(matches!(
            from_bytes(&bytes, provider()),
            Err(ArchiveError::UnsupportedVersion { found }) if found > FORMAT_VERSION
        ));
    }

    #[rstest]
    fn empty_input_is_corrupt() {
        assert!(matches!(
            from_bytes(&[], provider()),
            Err(ArchiveError::CorruptData { .. })
        ));
    }
}
