//! Remote synchronization of download sources.
//!
//! Every download source points to a JSON catalog:
//!
//! ```json
//! {
//!   "name": "Example source",
//!   "downloads": [
//!     { "title": "Some title", "uris": ["magnet:?xt=..."], "uploadDate": "2024-01-01", "fileSize": "1.5 GB" }
//!   ]
//! }
//! ```
//!
//! [`SyncService`] re-validates a list of sources and reports a [`SourceUpdate`] per source.
//! [`HttpSyncService`] is the implementation fetching catalogs over HTTP with [`reqwest`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::{Client as ReqwestClient, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tracing::{debug, trace, warn};

use crate::errors::SyncError;
use crate::{DownloadSource, DownloadSourceStatus, SourceId};

/// Source catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    /// Name of the source.
    pub name: String,

    /// Downloads provided by the source.
    #[serde(default)]
    pub downloads: Vec<CatalogDownload>,
}

/// Single download in a source catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogDownload {
    pub title: String,
    #[serde(default)]
    pub uris: Vec<String>,
    #[serde(default)]
    pub upload_date: Option<String>,
    #[serde(default)]
    pub file_size: Option<String>,
}

/// Catalog fetched from source URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchedCatalog {
    pub catalog: Catalog,

    /// Entity tag of the catalog, if the server provided one.
    pub etag: Option<String>,
}

/// Outcome of synchronization of a single source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceUpdate {
    /// Primary key of synchronized source.
    pub id: SourceId,

    /// New status of the source.
    pub status: DownloadSourceStatus,

    /// New download count of the source.
    pub download_count: u32,

    /// New entity tag of the source catalog.
    pub etag: Option<String>,

    /// Fresh downloads of the source.
    ///
    /// `None` means the stored downloads stay as they are.
    pub downloads: Option<Vec<CatalogDownload>>,
}

impl SourceUpdate {
    /// Source is unchanged since the last synchronization.
    pub fn not_modified(source: &DownloadSource) -> Self {
        Self {
            id: source.id,
            status: DownloadSourceStatus::UpToDate,
            download_count: source.download_count,
            etag: source.etag.clone(),
            downloads: None,
        }
    }

    /// Source catalog could not be fetched.
    pub fn errored(source: &DownloadSource) -> Self {
        Self {
            id: source.id,
            status: DownloadSourceStatus::Errored,
            download_count: source.download_count,
            etag: source.etag.clone(),
            downloads: None,
        }
    }

    /// Source catalog was fetched.
    pub fn fetched(source: &DownloadSource, fetched: FetchedCatalog) -> Self {
        Self {
            id: source.id,
            status: DownloadSourceStatus::UpToDate,
            download_count: fetched.catalog.downloads.len() as u32,
            etag: fetched.etag,
            downloads: Some(fetched.catalog.downloads),
        }
    }
}

/// Remote service validating download sources.
#[async_trait]
pub trait SyncService: Send + Sync {
    /// Re-validate every source in `sources`.
    ///
    /// Returns one update per source. Fails only if the whole batch could not be processed.
    async fn sync(&self, sources: &[DownloadSource]) -> Result<Vec<SourceUpdate>, SyncError>;

    /// Fetch and parse catalog from `url`.
    async fn fetch_catalog(&self, url: &str) -> Result<FetchedCatalog, SyncError>;
}

/// Used to create precisely configured [`HttpSyncService`].
#[must_use]
#[derive(Clone, Debug, Default)]
pub struct HttpSyncServiceBuilder {
    reqwest_client: Option<ReqwestClient>,
    request_timeout: Option<Duration>,
    max_catalog_size: Option<usize>,
}

impl HttpSyncServiceBuilder {
    /// Set [`reqwest::Client`] to use for fetching catalogs.
    ///
    /// If not set, default [`reqwest::Client`] will be built.
    pub fn reqwest_client(&mut self, reqwest_client: ReqwestClient) -> &mut Self {
        self.reqwest_client = Some(reqwest_client);
        self
    }

    /// Set timeout of a single catalog request.
    ///
    /// If not set, requests never time out.
    pub fn request_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set max size of catalog body in bytes.
    ///
    /// If not set, [`HttpSyncService::DEFAULT_MAX_CATALOG_SIZE`] is used.
    pub fn max_catalog_size(&mut self, size: usize) -> &mut Self {
        self.max_catalog_size = Some(size);
        self
    }

    /// Build service.
    pub fn build(&self) -> Result<HttpSyncService, SyncError> {
        let reqwest_client = match &self.reqwest_client {
            Some(client) => client.clone(),
            None => ReqwestClient::builder().build()?,
        };
        Ok(HttpSyncService {
            reqwest_client,
            request_timeout: self.request_timeout,
            max_catalog_size: self
                .max_catalog_size
                .unwrap_or(HttpSyncService::DEFAULT_MAX_CATALOG_SIZE),
        })
    }
}

/// Fetch result.
enum Fetched {
    NotModified,
    Catalog(FetchedCatalog),
}

/// [`SyncService`] fetching source catalogs over HTTP.
///
/// Sources are fetched concurrently. A source with a known entity tag is fetched
/// with `If-None-Match`, so unchanged catalogs are not downloaded again.
pub struct HttpSyncService {
    reqwest_client: ReqwestClient,
    request_timeout: Option<Duration>,
    max_catalog_size: usize,
}

impl HttpSyncService {
    /// 64 MiB.
    pub const DEFAULT_MAX_CATALOG_SIZE: usize = 64 * 1024 * 1024;

    /// Create [`HttpSyncServiceBuilder`] for precise configuration.
    pub fn builder() -> HttpSyncServiceBuilder {
        HttpSyncServiceBuilder::default()
    }

    /// Create service with default configuration.
    pub fn new() -> Result<Self, SyncError> {
        Self::builder().build()
    }

    async fn sync_source(&self, source: &DownloadSource) -> SourceUpdate {
        debug!("synchronizing source {} ('{}')", source.id, source.url);
        match self.fetch(&source.url, source.etag.as_deref()).await {
            Ok(Fetched::NotModified) => {
                debug!("source {} is not modified", source.id);
                SourceUpdate::not_modified(source)
            }
            Ok(Fetched::Catalog(fetched)) => {
                debug!(
                    "source {} provides {} downloads",
                    source.id,
                    fetched.catalog.downloads.len()
                );
                SourceUpdate::fetched(source, fetched)
            }
            Err(err) => {
                warn!("failed to synchronize source {} ('{}'): {}", source.id, source.url, err);
                SourceUpdate::errored(source)
            }
        }
    }

    async fn fetch(&self, url: &str, etag: Option<&str>) -> Result<Fetched, SyncError> {
        trace!("fetching {}", url);
        let mut request = self.reqwest_client.get(url);
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(timeout) = self.request_timeout {
            request = request.timeout(timeout);
        }
        let response = request.send().await?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return Ok(Fetched::NotModified);
        }
        if status != StatusCode::OK {
            return Err(SyncError::UnexpectedStatus(status.as_u16()));
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result?;
            if body.len() + chunk.len() > self.max_catalog_size {
                return Err(SyncError::CatalogTooLarge {
                    limit: self.max_catalog_size,
                });
            }
            body.extend_from_slice(&chunk);
        }

        let catalog: Catalog = serde_json::from_slice(&body)?;
        Ok(Fetched::Catalog(FetchedCatalog { catalog, etag }))
    }
}

#[async_trait]
impl SyncService for HttpSyncService {
    async fn sync(&self, sources: &[DownloadSource]) -> Result<Vec<SourceUpdate>, SyncError> {
        let updates =
            future::join_all(sources.iter().map(|source| self.sync_source(source))).await;
        Ok(updates)
    }

    async fn fetch_catalog(&self, url: &str) -> Result<FetchedCatalog, SyncError> {
        match self.fetch(url, None).await? {
            Fetched::Catalog(fetched) => Ok(fetched),
            Fetched::NotModified => Err(SyncError::UnexpectedStatus(
                StatusCode::NOT_MODIFIED.as_u16(),
            )),
        }
    }
}

impl fmt::Debug for HttpSyncService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSyncService")
            .field("reqwest_client", &self.reqwest_client)
            .field("request_timeout", &self.request_timeout)
            .field("max_catalog_size", &self.max_catalog_size)
            .finish()
    }
}
