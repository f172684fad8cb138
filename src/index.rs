//! Search index over downloads of all download sources.
//!
//! The index is always rebuilt from scratch from the database, so calling
//! [`Reindex::reindex`] repeatedly without changes in between yields the same index.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::database::{api, Pool};
use crate::errors::Error;
use crate::{Download, DownloadSource};

/// Rebuilds derived data after the list of download sources changed.
#[async_trait]
pub trait Reindex: Send + Sync {
    /// Rebuild from the current database state.
    async fn reindex(&self) -> Result<(), Error>;
}

/// Download together with the name of its source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IndexedDownload {
    pub download: Download,
    pub source_name: String,
}

/// Complete state of [`DownloadIndex`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexSnapshot {
    downloads: BTreeMap<i32, IndexedDownload>,
    tokens: BTreeMap<String, BTreeSet<i32>>,
}

impl IndexSnapshot {
    fn build(sources: &[DownloadSource], downloads: Vec<Download>) -> Self {
        let names: HashMap<_, _> = sources
            .iter()
            .map(|source| (source.id, source.name.as_str()))
            .collect();

        let mut snapshot = Self::default();
        for download in downloads {
            for token in tokenize(&download.title) {
                snapshot.tokens.entry(token).or_default().insert(download.id);
            }
            let source_name = names
                .get(&download.source_id)
                .map(|name| name.to_string())
                .unwrap_or_default();
            snapshot.downloads.insert(
                download.id,
                IndexedDownload {
                    download,
                    source_name,
                },
            );
        }
        snapshot
    }

    /// Number of indexed downloads.
    pub fn len(&self) -> usize {
        self.downloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.downloads.is_empty()
    }

    fn search(&self, query: &str) -> Vec<IndexedDownload> {
        let mut matching: Option<BTreeSet<i32>> = None;
        for token in tokenize(query) {
            let ids = self.tokens.get(&token).cloned().unwrap_or_default();
            matching = Some(match matching {
                Some(found) => found.intersection(&ids).copied().collect(),
                None => ids,
            });
        }

        let mut results: Vec<_> = matching
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.downloads.get(id).cloned())
            .collect();
        results.sort_by(|a, b| {
            a.download
                .title
                .cmp(&b.download.title)
                .then(a.download.id.cmp(&b.download.id))
        });
        results
    }
}

/// Lower-cased alphanumeric words of `text`.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
}

/// In-memory inverted index of download titles.
pub struct DownloadIndex {
    pool: Pool,
    state: RwLock<IndexSnapshot>,
}

impl DownloadIndex {
    /// Create empty index. Call [`Reindex::reindex`] to fill it.
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            state: RwLock::default(),
        }
    }

    /// Find downloads whose titles contain every word of `query`.
    ///
    /// Results are ordered by title.
    pub fn search(&self, query: &str) -> Vec<IndexedDownload> {
        self.state().search(query)
    }

    /// Copy of the whole index.
    pub fn snapshot(&self) -> IndexSnapshot {
        self.state().clone()
    }

    fn state(&self) -> RwLockReadGuard<'_, IndexSnapshot> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Reindex for DownloadIndex {
    async fn reindex(&self) -> Result<(), Error> {
        debug!("rebuilding download index");
        let mut connection = self.pool.get().await?;
        let sources: Vec<DownloadSource> = api::list_by_creation_time_ascending(connection.as_mut())
            .await?
            .into_iter()
            .map(Into::into)
            .collect();
        let downloads: Vec<Download> = api::all_downloads(connection.as_mut())
            .await?
            .into_iter()
            .map(Into::into)
            .collect();

        let snapshot = IndexSnapshot::build(&sources, downloads);
        info!(
            "indexed {} downloads from {} sources",
            snapshot.len(),
            sources.len()
        );
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::fixtures::{database, DatabaseFixture};
    use crate::remote::CatalogDownload;
    use rstest::rstest;
    use tracing_test::traced_test;

    fn catalog(titles: &[&str]) -> Vec<CatalogDownload> {
        titles
            .iter()
            .map(|title| CatalogDownload {
                title: title.to_string(),
                uris: vec![],
                upload_date: None,
                file_size: None,
            })
            .collect()
    }

    async fn index_with_downloads(database: &mut DatabaseFixture) -> DownloadIndex {
        api::new_source_with_downloads(
            &mut database.conn,
            "First",
            "http://localhost/first.json",
            None,
            &catalog(&["Half-Life 2", "Portal 2"]),
        )
        .await
        .unwrap();
        api::new_source_with_downloads(
            &mut database.conn,
            "Second",
            "http://localhost/second.json",
            None,
            &catalog(&["Portal", "Half-Life: Alyx"]),
        )
        .await
        .unwrap();
        DownloadIndex::new(database.pool())
    }

    #[test]
    fn test_tokenize() {
        let tokens: Vec<_> = tokenize("Half-Life 2: Episode ONE").collect();
        assert_eq!(tokens, vec!["half", "life", "2", "episode", "one"]);
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_reindex_and_search(#[future] mut database: DatabaseFixture) {
        let index = index_with_downloads(&mut database).await;
        assert!(index.snapshot().is_empty());

        index.reindex().await.expect("reindex");
        assert_eq!(index.snapshot().len(), 4);

        let titles: Vec<_> = index
            .search("half life")
            .into_iter()
            .map(|found| found.download.title)
            .collect();
        assert_eq!(titles, vec!["Half-Life 2", "Half-Life: Alyx"]);

        let found = index.search("PORTAL 2");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].source_name, "First");

        assert!(index.search("unknown").is_empty());
        assert!(index.search("").is_empty());
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_reindex_is_idempotent(#[future] mut database: DatabaseFixture) {
        let index = index_with_downloads(&mut database).await;

        index.reindex().await.unwrap();
        let once = index.snapshot();
        index.reindex().await.unwrap();
        assert_eq!(index.snapshot(), once);
    }

    #[rstest]
    #[tokio::test]
    #[traced_test]
    #[awt]
    async fn test_reindex_follows_database(#[future] mut database: DatabaseFixture) {
        let index = index_with_downloads(&mut database).await;
        index.reindex().await.unwrap();

        let first = api::get_by_url(&mut database.conn, "http://localhost/first.json")
            .await
            .unwrap()
            .unwrap();
        api::delete_source(&mut database.conn, first.id).await.unwrap();
        index.reindex().await.unwrap();

        assert_eq!(index.snapshot().len(), 2);
        assert!(index.search("portal 2").is_empty());
    }
}
