//! Error types for server communication.

use mapedit_core::{EditError, EntityRef};
use thiserror::Error;

use crate::overpass::QueryError;

/// Errors raised while talking to the map server or an Overpass endpoint.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The Overpass query failed syntactic validation before any request
    /// was issued.
    #[error("invalid query: {0}")]
    InvalidQuery(#[from] QueryError),
    /// The request could not reach the server.
    #[error("network error for {url}: {message}")]
    Network {
        /// Request URL.
        url: String,
        /// Transport-level detail.
        message: String,
    },
    /// The request exceeded the configured timeout.
    #[error("request to {url} timed out after {timeout_secs}s")]
    Timeout {
        /// Request URL.
        url: String,
        /// Configured timeout in seconds.
        timeout_secs: u64,
    },
    /// The server answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Http {
        /// Request URL.
        url: String,
        /// Status code.
        status: u16,
    },
    /// The response body could not be decoded.
    #[error("failed to parse server response: {message}")]
    Parse {
        /// Decoder detail.
        message: String,
    },
    /// An upload was requested while no local edits are pending.
    #[error("no local edits to upload")]
    NothingToUpload,
    /// The server refused part of an uploaded changeset. No local state
    /// has been touched when this is returned.
    #[error("upload rejected with status {status}: {reason}")]
    UploadRejected {
        /// The entity the server named as the cause, when it named one.
        entity: Option<EntityRef>,
        /// Status code.
        status: u16,
        /// Server-supplied reason text.
        reason: String,
    },
    /// Downloaded or confirmed data could not be folded into the store.
    #[error("failed to apply server data")]
    Merge {
        /// Underlying store error.
        #[source]
        source: EditError,
    },
}

impl From<EditError> for SyncError {
    fn from(source: EditError) -> Self {
        Self::Merge { source }
    }
}
