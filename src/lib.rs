//! # Download sources
//!
//! Keeps a list of download sources: remote JSON catalogs of downloadable items.
//! Sources are persisted in SQLite, removed by a background worker and
//! periodically synchronized with their remote catalogs.
//!
//! ## Example
//!
//! ```rust
//! # async fn test(database: &str) {
//! use download_sources::{SourceEvent, SourceManager};
//!
//! let manager = SourceManager::builder(database).build().await.unwrap();
//! let mut events = manager.subscribe_events();
//!
//! manager.add_source("https://example.com/catalog.json").await.unwrap();
//! assert_eq!(events.recv().await.unwrap(), SourceEvent::Added);
//!
//! for source in manager.sources() {
//!     println!("{}: {} ({} downloads)", source.name, source.status, source.download_count);
//! }
//! # }
//! ```

mod manager;
mod source;
mod worker;

pub mod database;
pub mod errors;
pub mod index;
pub mod notifier;
pub mod remote;

pub use index::{DownloadIndex, IndexedDownload, Reindex};
pub use manager::{
    ManagerOpts, ManagerOptsBuilder, SourceEvent, SourceManager, SourceManagerBuilder, SyncSummary,
};
pub use notifier::{Completion, CompletionNotifier, Ticket, Topic};
pub use remote::{HttpSyncService, HttpSyncServiceBuilder, SyncService};
pub use source::{Download, DownloadSource, DownloadSourceStatus, SourceId};
pub use worker::{SourcesWorker, WorkerCommand, WorkerHandle};

// Re-exports of public API arguments from extern crates
#[doc(no_inline)]
pub use chrono::{DateTime, Utc};
#[doc(no_inline)]
pub use tokio::time::Duration;
