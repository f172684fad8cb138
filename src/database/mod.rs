//! Download sources database.
//!
//! An SQLite database build with migrations from `./migrations`.

use diesel::{ConnectionError, ConnectionResult, SqliteConnection};
use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::pooled_connection::deadpool;
use diesel_async::pooled_connection::{AsyncDieselConnectionManager, ManagerConfig};
use diesel_async::sync_connection_wrapper::SyncConnectionWrapper;
use diesel_async::{AsyncConnection, SimpleAsyncConnection};
use diesel_migrations::{EmbeddedMigrations, MigrationHarness};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::time::Duration;
use tracing::trace;

#[doc(no_inline)]
pub use diesel_async::pooled_connection::deadpool::BuildError;

use crate::errors::DatabaseError;

pub mod api;
pub mod models;
pub mod schema;

/// Inner SQLite connection type.
pub type Connection = SyncConnectionWrapper<SqliteConnection>;

/// Result of database operations.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

const MIGRATIONS: EmbeddedMigrations =
    diesel_migrations::embed_migrations!("src/database/migrations");

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Establish connection with SQLite database and configure it with:
/// - `PRAGMA journal_mode = WAL`
/// - `PRAGMA synchronous = NORMAL`
/// - `PRAGMA busy_timeout = 10_000`
/// - `PRAGMA foreign_keys = ON`
fn establish_connection_inner(database_url: &str) -> BoxFuture<ConnectionResult<Connection>> {
    let fut = async move {
        trace!("establishing connection with {}", database_url);
        let mut connection = Connection::establish(database_url).await?;
        let query = format!(
            "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA busy_timeout = {}; PRAGMA foreign_keys = ON;",
            BUSY_TIMEOUT.as_millis()
        );
        trace!("executing: {}", &query);
        connection
            .batch_execute(&query)
            .await
            .map_err(ConnectionError::CouldntSetupConfiguration)?;
        Ok(connection)
    };
    fut.boxed()
}

/// Establish connection to SQLite database with database_url.
///
/// Attempts to establish connection with existing database.
/// If database does not exists, it will be created.
pub async fn establish_connection(database_url: &str) -> DatabaseResult<Connection> {
    Ok(establish_connection_inner(database_url).await?)
}

/// Run pending migrations on SQLite database specified with `database_url`.
///
/// Returns number of applied migrations.
pub async fn run_migrations(database_url: &str) -> DatabaseResult<usize> {
    let connection = establish_connection_inner(database_url).await?;
    let mut async_wrapper: AsyncConnectionWrapper<Connection> =
        AsyncConnectionWrapper::from(connection);

    trace!("running pending migrations");
    let applied = tokio::task::spawn_blocking(move || {
        async_wrapper
            .run_pending_migrations(MIGRATIONS)
            .map(|applied| {
                applied
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
            })
            .map_err(|e| DatabaseError::MigrationError(e.to_string()))
    })
    .await
    .map_err(|e| DatabaseError::MigrationError(e.to_string()))??;

    if applied.is_empty() {
        trace!("no migrations applied");
    } else {
        trace!("migrations applied:");
        for migration in &applied {
            trace!(" - {}", migration);
        }
    }
    Ok(applied.len())
}

/// Pool of connections to the database.
///
/// Use [`build_pool`] or [`build_pool_with_size`] to create.
pub type Pool = deadpool::Pool<Connection>;

/// Build database connection pool.
/// Max size of the pool defaults to `cpu_count * 4`.
///
/// Backed by [`diesel_async::pooled_connection::deadpool`].
pub fn build_pool(database_url: &str) -> Result<Pool, BuildError> {
    let mut manager_config = ManagerConfig::default();
    manager_config.custom_setup = Box::new(establish_connection_inner);
    let manager =
        AsyncDieselConnectionManager::<Connection>::new_with_config(database_url, manager_config);
    Pool::builder(manager).build()
}

/// Build database connection pool of certain max size.
pub fn build_pool_with_size(database_url: &str, max_size: usize) -> Result<Pool, BuildError> {
    let mut manager_config = ManagerConfig::default();
    manager_config.custom_setup = Box::new(establish_connection_inner);
    let manager =
        AsyncDieselConnectionManager::<Connection>::new_with_config(database_url, manager_config);
    Pool::builder(manager).max_size(max_size).build()
}

/// Database fixtures. Helps in testing database-related code.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::models::{NewSourceEntry, SourceEntry};
    use super::*;
    use crate::{DateTime, DownloadSourceStatus, Utc};
    use rstest::fixture;
    use tempfile::TempDir;

    /// Fixture which creates new database as temp file.
    /// Removes database on drop.
    pub(crate) struct DatabaseFixture {
        /// Just holds temp directory, which will be removed on drop.
        #[allow(dead_code)]
        tmp: TempDir,

        /// Path to database `*.sqlite` file.
        pub db_path: String,

        /// Database connection.
        pub conn: Connection,
    }

    impl DatabaseFixture {
        /// Create new empty temp database.
        pub async fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let db_path = tmp
                .path()
                .join("sources.sqlite")
                .to_str()
                .unwrap()
                .to_string();
            run_migrations(&db_path).await.unwrap();
            let conn = establish_connection(&db_path).await.unwrap();
            Self { tmp, db_path, conn }
        }

        /// Insert entry as is.
        pub async fn insert_entry(&mut self, entry: NewSourceEntry) -> SourceEntry {
            unsafe { api::insert_unsafe(&mut self.conn, entry) }
                .await
                .unwrap()
        }

        /// Build connection pool to the fixture database.
        pub fn pool(&self) -> Pool {
            build_pool_with_size(&self.db_path, 4).unwrap()
        }
    }

    /// Source named `name` created at `created_at` with given status and download count.
    pub fn source_entry(
        name: &str,
        status: DownloadSourceStatus,
        download_count: i32,
        created_at: DateTime<Utc>,
    ) -> NewSourceEntry {
        NewSourceEntry {
            name: name.to_string(),
            url: format!("http://localhost/{}.json", name.to_lowercase()),
            etag: None,
            status: status.into(),
            download_count,
            created_at,
            updated_at: created_at,
        }
    }

    /// Source `X` created at `t1`.
    pub fn source_x() -> NewSourceEntry {
        source_entry(
            "X",
            DownloadSourceStatus::UpToDate,
            5,
            DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
        )
    }

    /// Source `Y` created at `t2 > t1`.
    pub fn source_y() -> NewSourceEntry {
        source_entry(
            "Y",
            DownloadSourceStatus::Errored,
            0,
            DateTime::<Utc>::from_timestamp(1_700_000_100, 0).unwrap(),
        )
    }

    /// New empty database.
    #[fixture]
    pub async fn database() -> DatabaseFixture {
        DatabaseFixture::new().await
    }

    /// New database with sources `X` and `Y`. `Y` is inserted first, but is newer.
    #[fixture]
    pub async fn database_with_sources() -> (DatabaseFixture, SourceEntry, SourceEntry) {
        let mut fixture = DatabaseFixture::new().await;
        let x = fixture.insert_entry(source_x()).await;
        let y = fixture.insert_entry(source_y()).await;
        (fixture, x, y)
    }
}
