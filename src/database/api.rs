//! Convenient API to interact with download sources database.
//!
//! Basically just fancy wrappers around transactions on [`Connection`].

use chrono::Utc;
use diesel::{ExpressionMethods, OptionalExtension, QueryDsl, SelectableHelper};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use tracing::trace;

use crate::database::models::{
    DownloadEntry, NewDownloadEntry, NewSourceEntry, SourceEntry, StatusModel,
};
use crate::database::schema::{download_sources, downloads};
use crate::errors::DatabaseError;
use crate::remote::{CatalogDownload, SourceUpdate};
use crate::{DownloadSourceStatus, SourceId};

use super::{Connection, DatabaseResult};

/// Raw insert to database.
///
/// Consider using [`new_source`] instead.
///
/// # Safety
///
/// Although it is technically safe to use this method, it may confuse
/// semantics of the fields.
pub async unsafe fn insert_unsafe(
    connection: &mut Connection,
    new_entry: NewSourceEntry,
) -> DatabaseResult<SourceEntry> {
    connection
        .immediate_transaction(|conn| {
            async {
                trace!("INSERT {:?}", new_entry);
                let inserted = diesel::insert_into(download_sources::table)
                    .values(&new_entry)
                    .get_result::<SourceEntry>(conn)
                    .await?;
                Ok(inserted)
            }
            .scope_boxed()
        })
        .await
}

/// Add new source to database.
///
/// `created_at` timestamp is set to current UTC.
/// `status` is set to default (`Pending`).
pub async fn new_source(
    connection: &mut Connection,
    name: &str,
    url: &str,
) -> DatabaseResult<SourceEntry> {
    let new_entry = NewSourceEntry::new(name, url);
    unsafe { insert_unsafe(connection, new_entry).await }
}

/// Add new source together with the downloads of its already validated catalog.
///
/// The source is stored as `UpToDate` with download count of `downloads`.
pub async fn new_source_with_downloads(
    connection: &mut Connection,
    name: &str,
    url: &str,
    etag: Option<&str>,
    downloads: &[CatalogDownload],
) -> DatabaseResult<SourceEntry> {
    let new_entry = NewSourceEntry {
        etag: etag.map(str::to_string),
        status: DownloadSourceStatus::UpToDate.into(),
        download_count: download_count(downloads.len() as u64)?,
        ..NewSourceEntry::new(name, url)
    };
    connection
        .immediate_transaction(|conn| {
            async {
                trace!("INSERT {:?}", new_entry);
                let inserted = diesel::insert_into(download_sources::table)
                    .values(&new_entry)
                    .get_result::<SourceEntry>(conn)
                    .await?;
                insert_downloads(conn, inserted.id, downloads).await?;
                Ok::<SourceEntry, DatabaseError>(inserted)
            }
            .scope_boxed()
        })
        .await
}

/// Get source from database by primary key.
pub async fn get_source(connection: &mut Connection, pk: SourceId) -> DatabaseResult<SourceEntry> {
    connection
        .transaction(|conn| {
            async {
                trace!("SELECT pk={}", pk);
                download_sources::dsl::download_sources
                    .find(pk)
                    .select(SourceEntry::as_select())
                    .first(conn)
                    .await
            }
            .scope_boxed()
        })
        .await
        .map_err(Into::into)
}

/// Get source from database by URL field.
pub async fn get_by_url(
    connection: &mut Connection,
    url: &str,
) -> DatabaseResult<Option<SourceEntry>> {
    connection
        .transaction(|conn| {
            async {
                let filter = download_sources::dsl::url.eq(url);
                trace!("SELECT url={}", url);
                download_sources::dsl::download_sources
                    .filter(filter)
                    .select(SourceEntry::as_select())
                    .first(conn)
                    .await
                    .optional()
            }
            .scope_boxed()
        })
        .await
        .map_err(Into::into)
}

/// Get all sources ordered by creation timestamp, oldest first.
///
/// Sources created at the same moment are ordered by primary key.
pub async fn list_by_creation_time_ascending(
    connection: &mut Connection,
) -> DatabaseResult<Vec<SourceEntry>> {
    connection
        .transaction(|conn| {
            async {
                trace!("SELECT * ORDER BY created_at");
                download_sources::dsl::download_sources
                    .order((
                        download_sources::dsl::created_at.asc(),
                        download_sources::dsl::id.asc(),
                    ))
                    .select(SourceEntry::as_select())
                    .get_results(conn)
                    .await
            }
            .scope_boxed()
        })
        .await
        .map_err(Into::into)
}

/// Delete source and all its downloads.
///
/// Deleting a source which does not exist is not an error.
/// Returns whether the source was actually deleted.
pub async fn delete_source(connection: &mut Connection, pk: SourceId) -> DatabaseResult<bool> {
    connection
        .immediate_transaction(|conn| {
            async {
                trace!("DELETE downloads source_id={}", pk);
                diesel::delete(downloads::dsl::downloads.filter(downloads::dsl::source_id.eq(pk)))
                    .execute(conn)
                    .await?;
                trace!("DELETE pk={}", pk);
                let deleted = diesel::delete(download_sources::dsl::download_sources.find(pk))
                    .execute(conn)
                    .await?;
                Ok::<bool, DatabaseError>(deleted > 0)
            }
            .scope_boxed()
        })
        .await
}

/// Store result of synchronization of a single source.
///
/// Updates status, download count and entity tag. If the update carries a new catalog,
/// downloads of the source are replaced with it.
///
/// Returns `None` if the source does not exist (anymore).
pub async fn apply_sync_result(
    connection: &mut Connection,
    update: &SourceUpdate,
) -> DatabaseResult<Option<SourceEntry>> {
    connection
        .immediate_transaction(|conn| {
            async { update_source(conn, update).await }.scope_boxed()
        })
        .await
}

/// Store results of synchronization of many sources in a single transaction.
///
/// Either every update is stored or none of them. Returns one entry per update,
/// `None` for sources which do not exist.
pub async fn apply_sync_results(
    connection: &mut Connection,
    updates: &[SourceUpdate],
) -> DatabaseResult<Vec<Option<SourceEntry>>> {
    connection
        .immediate_transaction(|conn| {
            async {
                let mut updated = Vec::with_capacity(updates.len());
                for update in updates {
                    updated.push(update_source(conn, update).await?);
                }
                Ok::<Vec<Option<SourceEntry>>, DatabaseError>(updated)
            }
            .scope_boxed()
        })
        .await
}

/// Update source row and its downloads. Must run inside a transaction.
async fn update_source(
    conn: &mut Connection,
    update: &SourceUpdate,
) -> DatabaseResult<Option<SourceEntry>> {
    use download_sources::dsl;

    let count = download_count(update.download_count.into())?;
    let row = dsl::download_sources.find(update.id);
    trace!(
        "UPDATE pk={}, status = {:?}, download count = {}",
        update.id,
        update.status,
        count
    );
    let updated: Option<SourceEntry> = diesel::update(row)
        .set((
            dsl::status.eq(StatusModel(update.status)),
            dsl::download_count.eq(count),
            dsl::etag.eq(update.etag.as_deref()),
            dsl::updated_at.eq(Utc::now()),
        ))
        .returning(SourceEntry::as_returning())
        .get_result(conn)
        .await
        .optional()?;

    if updated.is_none() {
        trace!("source pk={} does not exist, skipping", update.id);
        return Ok(None);
    }

    if let Some(catalog) = &update.downloads {
        trace!("DELETE downloads source_id={}", update.id);
        diesel::delete(downloads::dsl::downloads.filter(downloads::dsl::source_id.eq(update.id)))
            .execute(conn)
            .await?;
        insert_downloads(conn, update.id, catalog).await?;
    }

    Ok(updated)
}

/// Insert downloads of a source one by one. Must run inside a transaction.
async fn insert_downloads(
    conn: &mut Connection,
    source_id: SourceId,
    catalog: &[CatalogDownload],
) -> DatabaseResult<()> {
    trace!("INSERT {} downloads of source_id={}", catalog.len(), source_id);
    for download in catalog {
        let row = NewDownloadEntry::from_catalog(source_id, download);
        diesel::insert_into(downloads::table)
            .values(&row)
            .execute(conn)
            .await?;
    }
    Ok(())
}

fn download_count(count: u64) -> DatabaseResult<i32> {
    i32::try_from(count).map_err(|_| DatabaseError::DownloadCountOutOfRange(count))
}

/// Get all downloads of all sources.
pub async fn all_downloads(connection: &mut Connection) -> DatabaseResult<Vec<DownloadEntry>> {
    connection
        .transaction(|conn| {
            async {
                trace!("SELECT * FROM downloads");
                downloads::dsl::downloads
                    .order(downloads::dsl::id.asc())
                    .select(DownloadEntry::as_select())
                    .get_results(conn)
                    .await
            }
            .scope_boxed()
        })
        .await
        .map_err(Into::into)
}

/// Get downloads of a single source.
pub async fn downloads_of(
    connection: &mut Connection,
    source_id: SourceId,
) -> DatabaseResult<Vec<DownloadEntry>> {
    connection
        .transaction(|conn| {
            async {
                trace!("SELECT downloads source_id={}", source_id);
                downloads::dsl::downloads
                    .filter(downloads::dsl::source_id.eq(source_id))
                    .order(downloads::dsl::id.asc())
                    .select(DownloadEntry::as_select())
                    .get_results(conn)
                    .await
            }
            .scope_boxed()
        })
        .await
        .map_err(Into::into)
}
