//! HTTP gateway to the map server and Overpass.
//!
//! # Architecture
//!
//! The store and its callers are synchronous, so the client bridges the
//! async HTTP calls to a sync interface by blocking on a Tokio runtime it
//! owns. When called from inside an existing multi-threaded Tokio runtime
//! (detected via [`Handle::try_current()`]), it uses that runtime's handle
//! with [`tokio::task::block_in_place`] to avoid nested runtime panics;
//! from a `current_thread` runtime it falls back to its own runtime.
//!
//! # Example
//!
//! ```no_run
//! use geo::{Coord, Rect};
//! use mapedit_core::{MapData, Tags};
//! use mapedit_sync::{FetchRequest, OsmClient};
//!
//! let client = OsmClient::new("https://api.openstreetmap.org")?;
//! let mut map = MapData::new(Box::new(|_| Tags::new()));
//! let request = FetchRequest::BoundingBox(Rect::new(
//!     Coord { x: 7.1, y: 50.7 },
//!     Coord { x: 7.25, y: 50.8 },
//! ));
//! let outcome = client.download_into(&mut map, &request)?;
//! println!("merged {} entities", outcome.applied);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::future::Future;
use std::time::Duration;

use geo::Rect;
use log::{debug, info};
use mapedit_core::{EntityRef, EntitySet, MapData, MergeOutcome};
use reqwest::Client;
use serde::Deserialize;
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};

use crate::changeset::{ChangesetDocument, DiffResult, UploadReceipt, build_changeset};
use crate::error::SyncError;
use crate::overpass::validate_query;
use crate::payload::parse_payload;

/// Default public Overpass endpoint.
pub const DEFAULT_OVERPASS_URL: &str = "https://overpass-api.de/api/interpreter";

/// Default user agent for server requests.
pub const DEFAULT_USER_AGENT: &str = "mapedit/0.1";

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Normalize a server base URL so it carries exactly one trailing slash.
///
/// Idempotent: normalizing an already-normalized URL changes nothing.
///
/// # Examples
///
/// ```
/// use mapedit_sync::normalize_base_url;
///
/// assert_eq!(
///     normalize_base_url("https://api.openstreetmap.org"),
///     "https://api.openstreetmap.org/"
/// );
/// assert_eq!(
///     normalize_base_url("https://api.openstreetmap.org///"),
///     "https://api.openstreetmap.org/"
/// );
/// ```
#[must_use]
pub fn normalize_base_url(url: &str) -> String {
    format!("{}/", url.trim_end_matches('/'))
}

/// Error type for [`OsmClient`] construction failures.
#[derive(Debug)]
pub enum ClientBuildError {
    /// A supplied URL did not parse as an absolute URL.
    InvalidUrl(url::ParseError),
    /// Failed to build the HTTP client.
    HttpClient(reqwest::Error),
    /// Failed to build the Tokio runtime.
    Runtime(std::io::Error),
}

impl std::fmt::Display for ClientBuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidUrl(err) => write!(f, "invalid server URL: {err}"),
            Self::HttpClient(err) => write!(f, "failed to build HTTP client: {err}"),
            Self::Runtime(err) => write!(f, "failed to build Tokio runtime: {err}"),
        }
    }
}

impl std::error::Error for ClientBuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidUrl(err) => Some(err),
            Self::HttpClient(err) => Some(err),
            Self::Runtime(err) => Some(err),
        }
    }
}

/// Configuration for [`OsmClient`].
#[derive(Debug, Clone)]
pub struct OsmClientConfig {
    /// Base URL of the editing API (e.g. `"https://api.openstreetmap.org"`).
    pub base_url: String,
    /// Overpass endpoint for ad-hoc queries.
    pub overpass_url: String,
    /// Request timeout duration.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for OsmClientConfig {
    fn default() -> Self {
        Self {
            base_url: normalize_base_url("https://api.openstreetmap.org"),
            overpass_url: DEFAULT_OVERPASS_URL.to_owned(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
        }
    }
}

impl OsmClientConfig {
    /// Create a new configuration with the given base URL.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base_url(&base_url.into()),
            ..Default::default()
        }
    }

    /// Set the Overpass endpoint.
    #[must_use]
    pub fn with_overpass_url(mut self, overpass_url: impl Into<String>) -> Self {
        self.overpass_url = overpass_url.into();
        self
    }

    /// Set the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the user agent string.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}

/// A download request: either a bounding box against the editing API or an
/// Overpass query.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchRequest {
    /// Fetch everything inside a WGS84 rectangle.
    BoundingBox(Rect<f64>),
    /// Run an Overpass QL query. Validated before any request is issued.
    Overpass(String),
}

/// Synchronous HTTP client for the map server.
///
/// Owns a reqwest client and a Tokio runtime that are reused across calls,
/// avoiding the overhead of creating a runtime per request.
pub struct OsmClient {
    client: Client,
    config: OsmClientConfig,
    runtime: Runtime,
}

impl std::fmt::Debug for OsmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OsmClient")
            .field("client", &self.client)
            .field("config", &self.config)
            .field("runtime", &"<tokio::runtime::Runtime>")
            .finish()
    }
}

impl OsmClient {
    /// Create a new client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL does not parse, or if the HTTP
    /// client or Tokio runtime fails to build.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientBuildError> {
        Self::with_config(OsmClientConfig::new(base_url))
    }

    /// Create a new client with explicit configuration.
    ///
    /// The base URL is normalized to carry exactly one trailing slash.
    ///
    /// # Errors
    ///
    /// Returns an error if a URL does not parse, or if the HTTP client or
    /// Tokio runtime fails to build.
    pub fn with_config(mut config: OsmClientConfig) -> Result<Self, ClientBuildError> {
        config.base_url = normalize_base_url(&config.base_url);
        url::Url::parse(&config.base_url).map_err(ClientBuildError::InvalidUrl)?;
        url::Url::parse(&config.overpass_url).map_err(ClientBuildError::InvalidUrl)?;
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.timeout)
            .timeout(config.timeout)
            .build()
            .map_err(ClientBuildError::HttpClient)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ClientBuildError::Runtime)?;
        Ok(Self {
            client,
            config,
            runtime,
        })
    }

    /// The normalized base URL requests are issued against.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Point the client at a different server.
    ///
    /// The URL is normalized before use, so repeated calls with the same
    /// input settle on the same base URL.
    ///
    /// # Errors
    ///
    /// Returns [`ClientBuildError::InvalidUrl`] when the URL does not
    /// parse; the previous base URL is kept in that case.
    pub fn set_server(&mut self, base_url: &str) -> Result<(), ClientBuildError> {
        let normalized = normalize_base_url(base_url);
        url::Url::parse(&normalized).map_err(ClientBuildError::InvalidUrl)?;
        info!("switching server to {normalized}");
        self.config.base_url = normalized;
        Ok(())
    }

    /// Download the entities a request selects.
    ///
    /// # Errors
    ///
    /// - [`SyncError::InvalidQuery`] for a malformed Overpass query, found
    ///   before any request is issued.
    /// - [`SyncError::Network`] / [`SyncError::Timeout`] / [`SyncError::Http`]
    ///   for transport failures.
    /// - [`SyncError::Parse`] / [`SyncError::Merge`] for undecodable bodies.
    pub fn fetch(&self, request: &FetchRequest) -> Result<EntitySet, SyncError> {
        let body = match request {
            FetchRequest::BoundingBox(bbox) => {
                let url = self.map_url(bbox);
                self.block_on(self.get_text(url))?
            }
            FetchRequest::Overpass(query) => {
                validate_query(query)?;
                self.block_on(self.post_overpass(query))?
            }
        };
        let set = parse_payload(&body)?;
        debug!("fetched {} entities", set.len());
        Ok(set)
    }

    /// Download and merge in one step.
    ///
    /// The merge is all-or-nothing: on any error the store is unchanged.
    ///
    /// # Errors
    ///
    /// As [`Self::fetch`], plus [`SyncError::Merge`] when the downloaded
    /// block is internally inconsistent.
    pub fn download_into(
        &self,
        map: &mut MapData,
        request: &FetchRequest,
    ) -> Result<MergeOutcome, SyncError> {
        let set = self.fetch(request)?;
        let outcome = map.merge_remote(&set)?;
        info!(
            "merged {} entities, skipped {} locally edited",
            outcome.applied,
            outcome.skipped.len()
        );
        Ok(outcome)
    }

    /// Upload every pending local edit as one changeset, then fold the
    /// server's answer back into the store.
    ///
    /// The store is only touched after the server accepts the whole
    /// changeset; a rejection leaves every placeholder, flag, and
    /// tombstone as it was.
    ///
    /// # Errors
    ///
    /// - [`SyncError::NothingToUpload`] when no local edits are pending.
    /// - [`SyncError::UploadRejected`] when the server refuses the
    ///   changeset; the store is unchanged.
    /// - Transport and decoding errors as for [`Self::fetch`].
    pub fn upload(&self, map: &mut MapData, comment: &str) -> Result<UploadReceipt, SyncError> {
        let document = build_changeset(map, comment);
        if document.is_empty() {
            return Err(SyncError::NothingToUpload);
        }
        let url = format!("{}api/0.6/changeset/upload.json", self.config.base_url);
        let diff: DiffResult = self.block_on(self.post_changeset(&url, &document))?;
        let confirmation = diff.into_confirmation()?;
        let receipt = UploadReceipt {
            changeset: confirmation.changeset,
            created: confirmation.remap.nodes.len()
                + confirmation.remap.ways.len()
                + confirmation.remap.relations.len(),
            modified: document.modified.len(),
            deleted: confirmation.deleted.len(),
        };
        map.confirm_sync(&confirmation)?;
        info!(
            "changeset {} accepted: {} created, {} modified, {} deleted",
            receipt.changeset, receipt.created, receipt.modified, receipt.deleted
        );
        Ok(receipt)
    }

    /// Build the bounding-box download URL.
    ///
    /// The format is `{base}api/0.6/map.json?bbox=left,bottom,right,top`.
    fn map_url(&self, bbox: &Rect<f64>) -> String {
        format!(
            "{}api/0.6/map.json?bbox={},{},{},{}",
            self.config.base_url,
            bbox.min().x,
            bbox.min().y,
            bbox.max().x,
            bbox.max().y,
        )
    }

    async fn get_text(&self, url: String) -> Result<String, SyncError> {
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| self.convert_reqwest_error(&err, &url))?
            .error_for_status()
            .map_err(|err| self.convert_reqwest_error(&err, &url))?;
        response
            .text()
            .await
            .map_err(|err| self.convert_reqwest_error(&err, &url))
    }

    async fn post_overpass(&self, query: &str) -> Result<String, SyncError> {
        let url = &self.config.overpass_url;
        let response = self
            .client
            .post(url)
            .form(&[("data", query)])
            .send()
            .await
            .map_err(|err| self.convert_reqwest_error(&err, url))?
            .error_for_status()
            .map_err(|err| self.convert_reqwest_error(&err, url))?;
        response
            .text()
            .await
            .map_err(|err| self.convert_reqwest_error(&err, url))
    }

    async fn post_changeset(
        &self,
        url: &str,
        document: &ChangesetDocument,
    ) -> Result<DiffResult, SyncError> {
        let response = self
            .client
            .post(url)
            .json(document)
            .send()
            .await
            .map_err(|err| self.convert_reqwest_error(&err, url))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(rejection_from_body(status.as_u16(), &body));
        }
        response.json().await.map_err(|err| SyncError::Parse {
            message: err.to_string(),
        })
    }

    /// Convert a reqwest error to a [`SyncError`].
    fn convert_reqwest_error(&self, error: &reqwest::Error, url: &str) -> SyncError {
        if error.is_timeout() {
            return SyncError::Timeout {
                url: url.to_owned(),
                timeout_secs: self.config.timeout.as_secs(),
            };
        }
        if let Some(status) = error.status() {
            return SyncError::Http {
                url: url.to_owned(),
                status: status.as_u16(),
            };
        }
        SyncError::Network {
            url: url.to_owned(),
            message: error.to_string(),
        }
    }

    /// Run a future to completion from sync code.
    ///
    /// Uses the ambient multi-threaded runtime when one is present,
    /// otherwise the client's own stored runtime.
    fn block_on<F: Future>(&self, future: F) -> F::Output {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| handle.block_on(future))
            }
            _ => self.runtime.block_on(future),
        }
    }
}

/// Body shape some servers attach to a refused upload.
#[derive(Debug, Deserialize)]
struct RejectionBody {
    message: Option<String>,
    entity: Option<RejectedEntity>,
}

#[derive(Debug, Deserialize)]
struct RejectedEntity {
    #[serde(rename = "type", with = "crate::payload::kind_repr")]
    kind: mapedit_core::EntityKind,
    id: i64,
}

fn rejection_from_body(status: u16, body: &str) -> SyncError {
    let parsed: Option<RejectionBody> = serde_json::from_str(body).ok();
    let (entity, reason) = match parsed {
        Some(rejection) => (
            rejection.entity.map(|e| EntityRef {
                kind: e.kind,
                id: e.id,
            }),
            rejection.message.unwrap_or_else(|| body.to_owned()),
        ),
        None => (None, body.to_owned()),
    };
    SyncError::UploadRejected {
        entity,
        status,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::Coord;
    use mapedit_core::Tags;
    use rstest::rstest;

    #[rstest]
    #[case("https://api.openstreetmap.org", "https://api.openstreetmap.org/")]
    #[case("https://api.openstreetmap.org/", "https://api.openstreetmap.org/")]
    #[case("https://api.openstreetmap.org///", "https://api.openstreetmap.org/")]
    fn base_urls_get_exactly_one_trailing_slash(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_base_url(input), expected);
    }

    #[rstest]
    fn normalization_is_idempotent() {
        let once = normalize_base_url("https://example.org/osm");
        assert_eq!(normalize_base_url(&once), once);
    }

    #[rstest]
    fn client_normalizes_its_configured_base_url() {
        let client = OsmClient::new("https://example.org/osm").expect("client builds");
        assert_eq!(client.base_url(), "https://example.org/osm/");
    }

    #[rstest]
    fn set_server_renormalizes_and_keeps_old_url_on_failure() {
        let mut client = OsmClient::new("https://example.org").expect("client builds");

        client.set_server("https://mirror.example.org//").expect("valid URL");
        assert_eq!(client.base_url(), "https://mirror.example.org/");

        assert!(client.set_server("not a url").is_err());
        assert_eq!(client.base_url(), "https://mirror.example.org/");
    }

    #[rstest]
    fn invalid_base_url_is_rejected_at_build_time() {
        assert!(matches!(
            OsmClient::new("not a url"),
            Err(ClientBuildError::InvalidUrl(_))
        ));
    }

    #[rstest]
    fn map_url_lists_bbox_as_left_bottom_right_top() {
        let client = OsmClient::new("https://example.org").expect("client builds");
        let bbox = Rect::new(Coord { x: 7.1, y: 50.7 }, Coord { x: 7.25, y: 50.8 });

        assert_eq!(
            client.map_url(&bbox),
            "https://example.org/api/0.6/map.json?bbox=7.1,50.7,7.25,50.8"
        );
    }

    #[rstest]
    fn malformed_overpass_query_never_reaches_the_network() {
        let client = OsmClient::new("https://example.org").expect("client builds");

        let result = client.fetch(&FetchRequest::Overpass("**".into()));

        assert!(matches!(result, Err(SyncError::InvalidQuery(_))));
    }

    #[rstest]
    fn upload_with_nothing_pending_is_refused() {
        let client = OsmClient::new("https://example.org").expect("client builds");
        let mut map = MapData::new(Box::new(|_| Tags::new()));

        assert!(matches!(
            client.upload(&mut map, "noop"),
            Err(SyncError::NothingToUpload)
        ));
    }

    #[rstest]
    fn rejection_body_details_are_surfaced() {
        let error = rejection_from_body(
            409,
            r#"{"message": "version mismatch", "entity": {"type": "way", "id": 30}}"#,
        );

        match error {
            SyncError::UploadRejected {
                entity,
                status,
                reason,
            } => {
                assert_eq!(entity, Some(EntityRef::way(30)));
                assert_eq!(status, 409);
                assert_eq!(reason, "version mismatch");
            }
            other => panic!("expected a rejection, got {other}"),
        }
    }

    #[rstest]
    fn opaque_rejection_body_is_kept_verbatim() {
        let error = rejection_from_body(500, "internal error");

        match error {
            SyncError::UploadRejected { entity, reason, .. } => {
                assert_eq!(entity, None);
                assert_eq!(reason, "internal error");
            }
            other => panic!("expected a rejection, got {other}"),
        }
    }
}
