//! Lifecycle of download sources.
//!
//! [`SourceManager`] keeps the latest known list of download sources and runs
//! add, remove and sync operations on it:
//!
//! - removal is dispatched to the background worker, and the manager waits for
//!   its completion on a dedicated [`Topic`](crate::notifier::Topic);
//! - synchronization sends the current list to a [`SyncService`] and stores the results.
//!
//! After every successful operation the list is re-read from the database,
//! the [`Reindex`] collaborator is invoked and a [`SourceEvent`] is emitted.
//!
//! # Example
//!
//! ```rust
//! # async fn test(database_url: &str) {
//! use download_sources::SourceManager;
//!
//! let manager = SourceManager::builder(database_url).build().await.unwrap();
//!
//! let source = manager.add_source("https://example.com/catalog.json").await.unwrap();
//! manager.sync().await.unwrap();
//! manager.remove(source.id).await.unwrap();
//! # }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use derive_builder::Builder;
use tokio::sync::broadcast;
use tokio::time::Duration;
use tracing::{debug, error, info, trace};

use crate::database::{self, api, Pool};
use crate::errors::{DatabaseError, Error};
use crate::index::{DownloadIndex, Reindex};
use crate::notifier::{Completion, CompletionNotifier};
use crate::remote::{HttpSyncService, SourceUpdate, SyncService};
use crate::worker::{SourcesWorker, WorkerCommand, WorkerHandle};
use crate::{DownloadSource, DownloadSourceStatus, SourceId};

mod events;

pub use events::{SourceEvent, SyncSummary};

type Result<T> = std::result::Result<T, Error>;

/// Manager options. Use [`ManagerOptsBuilder`] to create.
#[derive(Builder, Clone, Debug)]
#[builder(setter(into))]
#[builder(default)]
pub struct ManagerOpts {
    /// How long to wait for the worker to report removal of a source.
    ///
    /// Defaults to 30 seconds.
    delete_timeout: Duration,

    /// Capacity of the event channel. Slow event receivers lag behind after that many events.
    ///
    /// Defaults to 64.
    event_capacity: usize,
}

impl ManagerOpts {
    /// Create new builder for manager options.
    pub fn builder() -> ManagerOptsBuilder {
        ManagerOptsBuilder::default()
    }
}

impl Default for ManagerOpts {
    fn default() -> Self {
        Self {
            delete_timeout: Duration::from_secs(30),
            event_capacity: 64,
        }
    }
}

/// Used to create precisely configured [`SourceManager`].
#[must_use]
#[derive(Clone, Default)]
pub struct SourceManagerBuilder {
    database_url: String,
    pool: Option<Pool>,
    worker: Option<WorkerHandle>,
    sync_service: Option<Arc<dyn SyncService>>,
    indexer: Option<Arc<dyn Reindex>>,
    opts: ManagerOpts,
}

impl SourceManagerBuilder {
    /// Create new manager builder.
    pub fn new(database_url: &str) -> Self {
        Self {
            database_url: database_url.to_string(),
            ..Default::default()
        }
    }

    /// Set connection pool to the database.
    ///
    /// If not set, new pool will be built from database URL.
    pub fn pool(&mut self, pool: Pool) -> &mut Self {
        self.pool = Some(pool);
        self
    }

    /// Set worker to dispatch removals to.
    ///
    /// If not set, new [`SourcesWorker`] will be spawned.
    pub fn worker(&mut self, worker: WorkerHandle) -> &mut Self {
        self.worker = Some(worker);
        self
    }

    /// Set service used to synchronize and validate sources.
    ///
    /// If not set, [`HttpSyncService`] with default configuration is used.
    pub fn sync_service(&mut self, sync_service: Arc<dyn SyncService>) -> &mut Self {
        self.sync_service = Some(sync_service);
        self
    }

    /// Set collaborator rebuilding derived data after the list of sources changed.
    ///
    /// If not set, [`DownloadIndex`] is used.
    pub fn indexer(&mut self, indexer: Arc<dyn Reindex>) -> &mut Self {
        self.indexer = Some(indexer);
        self
    }

    /// Set manager options.
    pub fn opts(&mut self, opts: ManagerOpts) -> &mut Self {
        self.opts = opts;
        self
    }

    /// Build manager.
    ///
    /// Runs pending migrations and loads the list of download sources.
    pub async fn build(&self) -> Result<SourceManager> {
        trace!("running migrations on {}", self.database_url);
        database::run_migrations(&self.database_url).await?;

        let pool = match &self.pool {
            Some(pool) => pool.clone(),
            None => database::build_pool(&self.database_url).map_err(DatabaseError::from)?,
        };
        let worker = match &self.worker {
            Some(worker) => worker.clone(),
            None => SourcesWorker::spawn(pool.clone(), CompletionNotifier::new()).0,
        };
        let sync_service = match &self.sync_service {
            Some(sync_service) => sync_service.clone(),
            None => Arc::new(HttpSyncService::new()?),
        };
        let indexer = match &self.indexer {
            Some(indexer) => indexer.clone(),
            None => Arc::new(DownloadIndex::new(pool.clone())),
        };

        let manager = SourceManager::new(pool, worker, sync_service, indexer, self.opts.clone());
        manager.refresh().await?;
        Ok(manager)
    }
}

impl fmt::Debug for SourceManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceManagerBuilder")
            .field("database_url", &self.database_url)
            .field("opts", &self.opts)
            .finish()
    }
}

/// Download sources manager.
///
/// Every collaborator is passed explicitly on construction. Flags [`Self::is_syncing`] and
/// [`Self::is_removing`] are always cleared once the corresponding operation settles,
/// whatever its outcome.
pub struct SourceManager {
    pool: Pool,
    worker: WorkerHandle,
    notifier: CompletionNotifier,
    sync_service: Arc<dyn SyncService>,
    indexer: Arc<dyn Reindex>,
    opts: ManagerOpts,

    /// Latest known list, newest first.
    sources: RwLock<Vec<DownloadSource>>,
    syncing: AtomicBool,
    removing: Mutex<HashSet<SourceId>>,
    events: broadcast::Sender<SourceEvent>,
}

impl SourceManager {
    /// Create [`SourceManagerBuilder`] for precise [`SourceManager`] configuration.
    pub fn builder(database_url: &str) -> SourceManagerBuilder {
        SourceManagerBuilder::new(database_url)
    }

    /// Create manager from its collaborators.
    ///
    /// The list of sources is empty until [`Self::refresh`] is called.
    pub fn new(
        pool: Pool,
        worker: WorkerHandle,
        sync_service: Arc<dyn SyncService>,
        indexer: Arc<dyn Reindex>,
        opts: ManagerOpts,
    ) -> Self {
        let (events, _) = broadcast::channel(opts.event_capacity.max(1));
        Self {
            pool,
            notifier: worker.notifier().clone(),
            worker,
            sync_service,
            indexer,
            opts,
            sources: RwLock::default(),
            syncing: AtomicBool::new(false),
            removing: Mutex::default(),
            events,
        }
    }

    /// Latest known list of download sources, newest first.
    pub fn sources(&self) -> Vec<DownloadSource> {
        self.sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Subscribe to user-facing notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SourceEvent> {
        self.events.subscribe()
    }

    /// Whether synchronization is in progress.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    /// Whether removal of any source is in progress.
    pub fn is_removing(&self) -> bool {
        !self
            .removing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    /// Whether synchronization makes sense right now:
    /// there are sources and no other operation is running.
    pub fn can_sync(&self) -> bool {
        !self.sources().is_empty() && !self.is_syncing() && !self.is_removing()
    }

    /// Re-read download sources from the database.
    ///
    /// Returns the new list, newest first.
    pub async fn refresh(&self) -> Result<Vec<DownloadSource>> {
        let mut connection = self.pool.get().await?;
        let mut sources: Vec<DownloadSource> =
            api::list_by_creation_time_ascending(connection.as_mut())
                .await?
                .into_iter()
                .map(Into::into)
                .collect();
        sources.reverse();
        debug!("loaded {} download sources", sources.len());
        *self.sources.write().unwrap_or_else(PoisonError::into_inner) = sources.clone();
        Ok(sources)
    }

    /// Report that a download source was inserted into the database by someone else.
    pub async fn on_added(&self) -> Result<()> {
        self.refresh().await?;
        self.indexer.reindex().await?;
        self.emit(SourceEvent::Added);
        Ok(())
    }

    /// Validate catalog at `url` and add it as a new download source.
    ///
    /// # Errors
    ///
    /// Returns error if:
    ///
    /// - source with this URL already exists
    /// - catalog cannot be fetched or parsed
    pub async fn add_source(&self, url: &str) -> Result<DownloadSource> {
        let url = url.trim();
        debug!("adding download source '{}'", url);
        {
            let mut connection = self.pool.get().await?;
            if api::get_by_url(connection.as_mut(), url).await?.is_some() {
                return Err(Error::SourceAlreadyExists(url.to_string()));
            }
        }

        let fetched = self.sync_service.fetch_catalog(url).await?;

        let entry = {
            let mut connection = self.pool.get().await?;
            api::new_source_with_downloads(
                connection.as_mut(),
                &fetched.catalog.name,
                url,
                fetched.etag.as_deref(),
                &fetched.catalog.downloads,
            )
            .await
            .map_err(|err| {
                // Someone added the same URL while we were fetching the catalog
                if err.is_unique_violation() {
                    Error::SourceAlreadyExists(url.to_string())
                } else {
                    err.into()
                }
            })?
        };
        info!(
            "download source '{}' added with {} downloads",
            entry.name, entry.download_count
        );

        self.on_added().await?;
        Ok(entry.into())
    }

    /// Remove download source `id`.
    ///
    /// The removal runs on the worker. Returns once the worker reported completion.
    /// Removing a source which does not exist succeeds.
    ///
    /// # Errors
    ///
    /// Returns error if:
    ///
    /// - removal of the same source is already in progress
    /// - worker reported a failure
    /// - worker did not report anything within the configured timeout
    pub async fn remove(&self, id: SourceId) -> Result<()> {
        let guard = RemovalGuard::acquire(&self.removing, id)?;

        let command = WorkerCommand::DeleteDownloadSource { id };
        let topic = command.topic();
        let subscription = self.notifier.subscribe(topic)?;
        self.worker.send(command, subscription.ticket());

        let completion = subscription.wait(self.opts.delete_timeout).await;
        drop(guard);

        match completion {
            Ok(Completion::Done) => {
                self.refresh().await?;
                self.indexer.reindex().await?;
                self.emit(SourceEvent::Removed { id });
                Ok(())
            }
            Ok(Completion::Failed(reason)) => {
                error!("failed to remove download source {}: {}", id, reason);
                self.emit(SourceEvent::RemoveFailed {
                    id,
                    reason: reason.clone(),
                });
                Err(Error::OperationFailed { topic, reason })
            }
            Err(err) => {
                error!("failed to remove download source {}: {}", id, err);
                self.emit(SourceEvent::RemoveFailed {
                    id,
                    reason: err.to_string(),
                });
                Err(err.into())
            }
        }
    }

    /// Synchronize the latest known list of sources with the remote service.
    ///
    /// Does nothing if there are no sources.
    ///
    /// # Errors
    ///
    /// Returns error if:
    ///
    /// - another synchronization is in progress
    /// - remote service failed; no source is updated then
    /// - results could not be stored
    pub async fn sync(&self) -> Result<SyncSummary> {
        let _flag = SyncFlag::raise(&self.syncing)?;

        let sources = self.sources();
        if sources.is_empty() {
            debug!("no download sources to synchronize");
            return Ok(SyncSummary::default());
        }

        info!("synchronizing {} download sources", sources.len());
        let result = match self.sync_service.sync(&sources).await {
            Ok(updates) => self.store_updates(&updates).await,
            Err(err) => Err(err.into()),
        };
        let summary = match result {
            Ok(summary) => summary,
            Err(err) => {
                error!("synchronization failed: {}", err);
                self.emit(SourceEvent::SyncFailed {
                    reason: err.to_string(),
                });
                return Err(err);
            }
        };

        self.refresh().await?;
        self.indexer.reindex().await?;
        info!(
            "synchronization finished: {} up to date, {} errored",
            summary.up_to_date, summary.errored
        );
        self.emit(SourceEvent::Synced(summary));
        Ok(summary)
    }

    /// Store all updates atomically.
    async fn store_updates(&self, updates: &[SourceUpdate]) -> Result<SyncSummary> {
        let mut connection = self.pool.get().await?;
        let stored = api::apply_sync_results(connection.as_mut(), updates).await?;
        let mut summary = SyncSummary::default();
        for (update, entry) in updates.iter().zip(stored) {
            match entry {
                None => summary.skipped += 1,
                Some(_) if update.status == DownloadSourceStatus::Errored => summary.errored += 1,
                Some(_) => summary.up_to_date += 1,
            }
        }
        Ok(summary)
    }

    fn emit(&self, event: SourceEvent) {
        trace!("emitting {:?}", event);
        if self.events.send(event).is_err() {
            trace!("no event receivers");
        }
    }
}

impl fmt::Debug for SourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceManager")
            .field("opts", &self.opts)
            .field("sources", &self.sources())
            .field("syncing", &self.is_syncing())
            .field("removing", &self.is_removing())
            .finish()
    }
}

/// Raised sync flag. Lowers the flag on drop.
struct SyncFlag<'a>(&'a AtomicBool);

impl<'a> SyncFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::SyncInProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for SyncFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Marks source as being removed. Unmarks on drop.
struct RemovalGuard<'a> {
    removing: &'a Mutex<HashSet<SourceId>>,
    id: SourceId,
}

impl<'a> RemovalGuard<'a> {
    fn acquire(removing: &'a Mutex<HashSet<SourceId>>, id: SourceId) -> Result<Self> {
        if !removing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id)
        {
            return Err(Error::RemovalInProgress(id));
        }
        Ok(Self { removing, id })
    }
}

impl Drop for RemovalGuard<'_> {
    fn drop(&mut self) {
        self.removing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}
