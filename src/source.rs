use std::fmt;

use serde::{Deserialize, Serialize};

use crate::database::models::{DownloadEntry, SourceEntry};
use crate::{DateTime, Utc};

/// Primary key of a download source.
pub type SourceId = i32;

/// Result of the last synchronization of a download source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadSourceStatus {
    /// Catalog was fetched and parsed successfully.
    UpToDate,

    /// Catalog could not be fetched or parsed.
    Errored,

    /// Source was never validated by synchronization.
    #[default]
    Pending,
}

impl fmt::Display for DownloadSourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match *self {
                Self::UpToDate => "UpToDate",
                Self::Errored => "Errored",
                Self::Pending => "Pending",
            }
        )
    }
}

/// Download source as stored in the database.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DownloadSource {
    /// Primary key of the source.
    pub id: SourceId,

    /// Display name.
    pub name: String,

    /// URL of the source catalog. Never changes after creation.
    pub url: String,

    /// Entity tag of the last fetched catalog, if the server provided one.
    pub etag: Option<String>,

    /// Result of the last synchronization.
    pub status: DownloadSourceStatus,

    /// Number of downloads provided by the source.
    pub download_count: u32,

    /// Creation timestamp. Used for ordering.
    pub created_at: DateTime<Utc>,

    /// Timestamp of the last synchronization which touched the source.
    pub updated_at: DateTime<Utc>,
}

impl From<SourceEntry> for DownloadSource {
    fn from(entry: SourceEntry) -> Self {
        Self {
            id: entry.id,
            name: entry.name,
            url: entry.url,
            etag: entry.etag,
            status: entry.status.into(),
            download_count: entry.download_count.max(0) as u32,
            created_at: entry.created_at,
            updated_at: entry.updated_at,
        }
    }
}

/// Single download listed in a source catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Download {
    pub id: i32,
    pub source_id: SourceId,
    pub title: String,
    pub uris: Vec<String>,
    pub file_size: Option<String>,
    pub upload_date: Option<String>,
}

impl From<DownloadEntry> for Download {
    fn from(entry: DownloadEntry) -> Self {
        Self {
            id: entry.id,
            source_id: entry.source_id,
            title: entry.title,
            uris: entry.uris.into(),
            file_size: entry.file_size,
            upload_date: entry.upload_date,
        }
    }
}
