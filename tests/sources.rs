//! Download sources integration tests.

use std::sync::Arc;

use http_test_server::http::{Method, Status};
use http_test_server::TestServer;
use tempfile::TempDir;

use download_sources::database::{api, build_pool, establish_connection};
use download_sources::remote::Catalog;
use download_sources::{
    DownloadIndex, DownloadSourceStatus, Reindex, SourceEvent, SourceManager, SyncSummary,
};

const CATALOG: &str = r#"{
    "name": "Open games",
    "downloads": [
        { "title": "Open Arena", "uris": ["magnet:?xt=arena"], "fileSize": "400 MB" },
        { "title": "Open TTD", "uris": ["magnet:?xt=ttd"], "uploadDate": "2024-03-12" },
        { "title": "Arena of Heroes", "uris": [] }
    ]
}"#;

#[tokio::test]
async fn test_source_lifecycle() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let db_path = format!("{}", tmp.path().join("sources.sqlite").display());

    let server = TestServer::new()?;
    server
        .create_resource("/games.json")
        .status(Status::OK)
        .method(Method::GET)
        .header("Content-Type", "application/json")
        .body(CATALOG);
    let url = format!("http://localhost:{}/games.json", server.port());

    let pool = build_pool(&db_path)?;
    let index = Arc::new(DownloadIndex::new(pool.clone()));
    let manager = SourceManager::builder(&db_path)
        .pool(pool)
        .indexer(index.clone())
        .build()
        .await?;
    let mut events = manager.subscribe_events();
    assert!(manager.sources().is_empty());
    assert!(!manager.can_sync());

    // Added source is validated and indexed right away
    let source = manager.add_source(&url).await?;
    assert_eq!(source.name, "Open games");
    assert_eq!(source.status, DownloadSourceStatus::UpToDate);
    assert_eq!(source.download_count, 3);
    assert_eq!(events.recv().await?, SourceEvent::Added);

    let titles: Vec<_> = index
        .search("arena")
        .into_iter()
        .map(|found| found.download.title)
        .collect();
    assert_eq!(titles, vec!["Arena of Heroes", "Open Arena"]);

    // Same catalog, nothing changes
    let summary = manager.sync().await?;
    assert_eq!(
        summary,
        SyncSummary {
            up_to_date: 1,
            errored: 0,
            skipped: 0
        }
    );
    assert_eq!(events.recv().await?, SourceEvent::Synced(summary));
    assert_eq!(manager.sources()[0].download_count, 3);

    manager.remove(source.id).await?;
    assert_eq!(
        events.recv().await?,
        SourceEvent::Removed { id: source.id }
    );
    assert!(manager.sources().is_empty());
    assert!(index.search("arena").is_empty());

    // Removed source is gone from the database too
    let reopened = SourceManager::builder(&db_path).build().await?;
    assert!(reopened.sources().is_empty());

    Ok(())
}

#[tokio::test]
async fn test_unreachable_source_is_errored() -> anyhow::Result<()> {
    let tmp = TempDir::new()?;
    let db_path = format!("{}", tmp.path().join("sources.sqlite").display());

    let manager = SourceManager::builder(&db_path).build().await?;

    // Source added by someone else, whose server is gone by now
    let catalog: Catalog = serde_json::from_str(CATALOG)?;
    let mut connection = establish_connection(&db_path).await?;
    let entry = api::new_source_with_downloads(
        &mut connection,
        &catalog.name,
        "http://127.0.0.1:1/games.json",
        None,
        &catalog.downloads,
    )
    .await?;
    manager.on_added().await?;
    assert_eq!(manager.sources().len(), 1);

    let summary = manager.sync().await?;
    assert_eq!(summary.errored, 1);

    let sources = manager.sources();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].id, entry.id);
    assert_eq!(sources[0].status, DownloadSourceStatus::Errored);
    // Last known downloads are kept
    assert_eq!(sources[0].download_count, 3);

    let index = DownloadIndex::new(build_pool(&db_path)?);
    index.reindex().await?;
    assert_eq!(index.search("open").len(), 2);

    Ok(())
}
