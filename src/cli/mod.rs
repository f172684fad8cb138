use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use directories::ProjectDirs;
use tokio::fs;

use download_sources::database::build_pool;
use download_sources::errors::NonUtf8PathError;
use download_sources::{
    CompletionNotifier, DownloadIndex, Duration, HttpSyncService, ManagerOpts, Reindex,
    SourceManager, SourcesWorker,
};

/// Calculate default database path based on OS.
fn default_database_path() -> PathBuf {
    if let Some(proj_dirs) = ProjectDirs::from("", "gevulot", "download-sources") {
        proj_dirs.data_dir().join("sources.sqlite")
    } else {
        PathBuf::from(".download-sources/sources.sqlite")
    }
}

/// CLI interface of download sources manager.
#[derive(Parser, Clone, Debug)]
#[command(version, about = "Download sources CLI")]
pub struct Cli {
    /// Path to database file.
    #[arg(
        short = 'd',
        long,
        value_name = "PATH",
        default_value = default_database_path().into_os_string(),
    )]
    database: PathBuf,

    /// Timeout of a single catalog request, in seconds.
    #[arg(long, value_name = "SECONDS", default_value_t = 30)]
    request_timeout: u64,

    /// How long to wait for removal of a source, in seconds.
    #[arg(long, value_name = "SECONDS", default_value_t = 30)]
    delete_timeout: u64,

    /// Command to execute.
    #[command(subcommand)]
    command: Command,
}

impl Cli {
    pub async fn execute(&self) -> anyhow::Result<()> {
        let database = self
            .database
            .as_os_str()
            .to_str()
            .ok_or(NonUtf8PathError)
            .context("failed to create database file")?;

        // Ensure database file has its parent directory
        if let Some(parent_dir) = self.database.parent() {
            fs::create_dir_all(parent_dir)
                .await
                .context("failed to create database file")?;
        }

        let pool = build_pool(database).context("failed to build connection pool")?;
        let (worker, _task) = SourcesWorker::spawn(pool.clone(), CompletionNotifier::new());
        let sync_service = HttpSyncService::builder()
            .request_timeout(Duration::from_secs(self.request_timeout))
            .build()
            .context("failed to build HTTP client")?;
        let index = Arc::new(DownloadIndex::new(pool.clone()));
        let opts = ManagerOpts::builder()
            .delete_timeout(Duration::from_secs(self.delete_timeout))
            .build()?;

        let manager = SourceManager::builder(database)
            .pool(pool)
            .worker(worker)
            .sync_service(Arc::new(sync_service))
            .indexer(index.clone())
            .opts(opts)
            .build()
            .await
            .context("failed to initialize download sources")?;

        self.command.execute(&manager, &index).await
    }
}

/// Download sources commands.
#[derive(Clone, Debug, clap::Subcommand)]
pub enum Command {
    /// List download sources, newest first.
    List {
        /// Print sources as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Validate catalog and add it as a new source.
    Add {
        /// URL of the catalog.
        url: String,
    },

    /// Remove download source and its downloads.
    Remove {
        /// ID of the source.
        id: i32,
    },

    /// Synchronize all sources with their catalogs.
    Sync,

    /// Search downloads of all sources by title.
    Search {
        /// Words to search for.
        #[arg(required = true)]
        query: Vec<String>,
    },
}

impl Command {
    pub async fn execute(&self, manager: &SourceManager, index: &DownloadIndex) -> anyhow::Result<()> {
        match self {
            Self::List { json } => {
                let sources = manager.sources();
                if *json {
                    println!("{}", serde_json::to_string_pretty(&sources)?);
                } else {
                    for source in sources {
                        println!(
                            "{}\t{}\t{}\t{}\t{}",
                            source.id, source.status, source.download_count, source.name, source.url
                        );
                    }
                }
            }
            Self::Add { url } => {
                let source = manager
                    .add_source(url)
                    .await
                    .with_context(|| format!("failed to add '{}'", url))?;
                println!("{:#?}", source);
            }
            Self::Remove { id } => {
                manager
                    .remove(*id)
                    .await
                    .with_context(|| format!("failed to remove source {}", id))?;
            }
            Self::Sync => {
                let summary = manager.sync().await.context("synchronization failed")?;
                println!(
                    "{} up to date, {} errored",
                    summary.up_to_date, summary.errored
                );
            }
            Self::Search { query } => {
                index.reindex().await.context("failed to build index")?;
                for found in index.search(&query.join(" ")) {
                    println!(
                        "{}\t{}\t{}",
                        found.source_name,
                        found.download.title,
                        found.download.uris.join(" ")
                    );
                }
            }
        }
        Ok(())
    }
}
