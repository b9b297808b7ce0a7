//! # Device Database
//!
//! One SQLite file per device holds the mutation queue, the pull
//! bookkeeping and a table per registered entity.
//!
//! ```text
//! Database::new(DbConfig)
//!       │
//!       ├── db.mutation_queue()  ← enqueue, claim, acknowledge
//!       ├── db.sync_meta()       ← per-entity pull bookkeeping
//!       └── db.records()         ← per-entity record tables
//! ```
//!
//! There is a single heavy writer, the bulk worker committing pulled
//! chunks. Everything else is short reads from screens and short queue
//! writes from the push pipeline, so the journal runs in WAL mode and a
//! screen query never waits behind a chunk commit.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::migrations;
use crate::repository::mutation_queue::MutationQueueRepository;
use crate::repository::records::RecordRepository;
use crate::repository::sync_meta::SyncMetaRepository;

/// How long a caller waits for a free connection. A chunk commit holds
/// its connection for at most one transaction.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

/// Where the device database lives and how it is opened.
///
/// ```rust,ignore
/// let config = DbConfig::new(app_dir.join("fieldops.db"));
/// ```
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_path: PathBuf,

    /// Upper bound on open connections: the bulk writer, the push
    /// pipeline and a few screen readers. Default: 5
    pub max_connections: u32,

    /// Apply pending schema migrations while opening. Default: true
    pub run_migrations: bool,
}

impl DbConfig {
    /// Opens (or creates) the database file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DbConfig {
            database_path: path.into(),
            max_connections: 5,
            run_migrations: true,
        }
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// With `false` the schema is left as found until
    /// [`Database::run_migrations`] is called.
    pub fn run_migrations(mut self, run: bool) -> Self {
        self.run_migrations = run;
        self
    }

    /// A private database for tests.
    ///
    /// Each SQLite connection to `:memory:` sees its own empty database,
    /// so the pool is pinned to one connection.
    pub fn in_memory() -> Self {
        DbConfig {
            database_path: PathBuf::from(":memory:"),
            max_connections: 1,
            run_migrations: true,
        }
    }
}

/// Handle to the device database.
///
/// Cloning is cheap: every clone shares the same pool. The sync engine
/// hands clones to its pipelines and to the bulk write worker.
///
/// ```rust,ignore
/// let db = Database::new(DbConfig::new("./fieldops.db")).await?;
/// let item = db.mutation_queue()
///     .enqueue("clients", "c-1", MutationOperation::Create, &payload)
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the pool and, unless disabled, brings the schema up to date.
    ///
    /// `synchronous = NORMAL` means a power cut can drop the last commit
    /// but never corrupts the file. A dropped queue write is re-made by
    /// the user; a dropped pulled chunk is fetched again on the next pull.
    pub async fn new(config: DbConfig) -> DbResult<Self> {
        info!(
            path = %config.database_path.display(),
            "Opening device database"
        );

        let connect_url = format!("sqlite://{}?mode=rwc", config.database_path.display());
        let connect_options = SqliteConnectOptions::from_str(&connect_url)
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(connect_options)
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;

        debug!(max_connections = config.max_connections, "Pool ready");

        let db = Database { pool };
        if config.run_migrations {
            db.run_migrations().await?;
        }
        Ok(db)
    }

    /// Applies any schema migration this build carries that the file
    /// has not seen yet.
    pub async fn run_migrations(&self) -> DbResult<()> {
        migrations::run_migrations(&self.pool).await?;
        info!("Device schema up to date");
        Ok(())
    }

    /// Raw pool, for migration status and tests.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn mutation_queue(&self) -> MutationQueueRepository {
        MutationQueueRepository::new(self.pool.clone())
    }

    pub fn sync_meta(&self) -> SyncMetaRepository {
        SyncMetaRepository::new(self.pool.clone())
    }

    pub fn records(&self) -> RecordRepository {
        RecordRepository::new(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database_is_migrated() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        assert_eq!(db.mutation_queue().pending_count().await.unwrap(), 0);
        assert!(db.sync_meta().get("clients").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repositories_share_pool() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let clone = db.clone();

        db.records().ensure_table("clients").await.unwrap();
        assert_eq!(clone.records().count("clients").await.unwrap(), 0);
        assert_eq!(clone.mutation_queue().pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_schema_left_alone_when_migrations_disabled() {
        let config = DbConfig::in_memory().max_connections(1).run_migrations(false);
        let db = Database::new(config).await.unwrap();

        let (total, applied) = migrations::migration_status(db.pool()).await.unwrap();
        assert!(total > 0);
        assert_eq!(applied, 0);

        db.run_migrations().await.unwrap();
        let (_, applied) = migrations::migration_status(db.pool()).await.unwrap();
        assert_eq!(applied, total);
    }
}
