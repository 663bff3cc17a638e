//! Database module for clientcache.
//!
//! This module provides the persistence layer using SQLite with sqlx.
//! It includes connection pool management, models and the low-level
//! repositories used by [`crate::cache::Repository`].

pub mod models;
pub mod repositories;
pub mod retry;
pub mod time;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{ConnectOptions, Pool, Row, Sqlite};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Serialized write pool type alias (max_connections=1).
pub type WritePool = Pool<Sqlite>;

/// File name of the cache database inside the dot directory.
pub const DATABASE_FILE_NAME: &str = "cache.db";

/// Default read pool size.
const DEFAULT_POOL_SIZE: u32 = 8;

/// Default busy timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Default WAL auto-checkpoint threshold in pages.
const DEFAULT_WAL_AUTOCHECKPOINT_PAGES: i32 = 1000;

async fn apply_per_connection_pragmas(
    conn: &mut sqlx::SqliteConnection,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "PRAGMA wal_autocheckpoint = {}",
        DEFAULT_WAL_AUTOCHECKPOINT_PAGES
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query("PRAGMA temp_store = MEMORY")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

async fn ensure_wal_mode(pool: &DbPool, pool_name: &str) -> Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    let row = sqlx::query("PRAGMA journal_mode")
        .fetch_one(&mut *conn)
        .await?;
    let mode: String = row.get(0);
    if mode != "wal" && mode != "memory" {
        tracing::warn!(pool = pool_name, mode = %mode, "journal_mode is not wal; re-setting");
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

fn connect_options(database_url: &str, debug: bool) -> Result<SqliteConnectOptions, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        // Readers keep seeing the last committed snapshot while a refresh commits.
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
        .foreign_keys(true)
        .create_if_missing(true);

    // Statement logging is the store's diagnostic output; only keep it in debug mode.
    Ok(if debug {
        options
    } else {
        options.disable_statement_logging()
    })
}

/// Initialize the read pool with WAL mode.
///
/// `debug` controls whether sqlx logs every statement it executes.
pub async fn init_pool_with_size(
    database_url: &str,
    max_connections: u32,
    debug: bool,
) -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_per_connection_pragmas(&mut *conn).await })
        })
        .connect_with(connect_options(database_url, debug)?)
        .await?;

    ensure_wal_mode(&pool, "read_pool").await?;

    tracing::info!(max_connections, "Database read pool initialized");

    Ok(pool)
}

/// Initialize the read pool with the default size.
pub async fn init_pool(database_url: &str, debug: bool) -> Result<DbPool, sqlx::Error> {
    init_pool_with_size(database_url, DEFAULT_POOL_SIZE, debug).await
}

/// Initialize a serialized write pool with `max_connections = 1`.
///
/// All mutations go through this pool, so only one connection ever
/// attempts to acquire the SQLite write lock.
pub async fn init_write_pool(database_url: &str, debug: bool) -> Result<WritePool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(60))
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_per_connection_pragmas(&mut *conn).await })
        })
        .connect_with(connect_options(database_url, debug)?)
        .await?;

    ensure_wal_mode(&pool, "write_pool").await?;

    tracing::info!("Write pool initialized with 1 max connection (serialized writes)");

    Ok(pool)
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))?;
    tracing::info!("Database migrations completed");
    Ok(())
}

pub async fn begin_immediate(pool: &WritePool) -> Result<ImmediateTransaction, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(ImmediateTransaction::new(conn))
}

/// Wrapper for a manual immediate transaction.
///
/// `BEGIN IMMEDIATE` takes the write lock up front. If the wrapper is dropped
/// without `commit`/`rollback` (for example when the owning future is
/// cancelled) the connection is closed, which rolls the transaction back.
pub struct ImmediateTransaction {
    conn: sqlx::pool::PoolConnection<Sqlite>,
    finished: bool,
}

impl ImmediateTransaction {
    pub fn new(conn: sqlx::pool::PoolConnection<Sqlite>) -> Self {
        Self {
            conn,
            finished: false,
        }
    }

    /// Commit the transaction.
    pub async fn commit(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("ROLLBACK").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }
}

impl std::ops::Deref for ImmediateTransaction {
    type Target = sqlx::SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.conn.close_on_drop();
        }
    }
}

/// Handle on the on-disk cache database: a read pool and a serialized write pool.
#[derive(Clone)]
pub struct Store {
    pool: DbPool,
    write_pool: WritePool,
    path: PathBuf,
}

impl Store {
    /// Open (creating if needed) the cache database inside `dot_dir` and apply migrations.
    pub async fn open(dot_dir: impl AsRef<Path>, debug: bool) -> crate::Result<Self> {
        let dot_dir = dot_dir.as_ref();
        tokio::fs::create_dir_all(dot_dir).await?;

        let path = dot_dir.join(DATABASE_FILE_NAME);
        let database_url = format!(
            "sqlite:{}?mode=rwc",
            path.to_string_lossy().replace('\\', "/")
        );

        // Migrate through the write pool first so the read pool never sees a partial schema.
        let write_pool = init_write_pool(&database_url, debug).await?;
        run_migrations(&write_pool).await?;
        let pool = init_pool(&database_url, debug).await?;

        tracing::info!(path = %path.display(), "Cache store opened");

        Ok(Self {
            pool,
            write_pool,
            path,
        })
    }

    /// Pool for read-only queries.
    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Single-connection pool for mutations.
    pub fn write_pool(&self) -> &WritePool {
        &self.write_pool
    }

    /// Location of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start an immediate transaction on the write pool.
    pub async fn begin(&self) -> crate::Result<ImmediateTransaction> {
        Ok(begin_immediate(&self.write_pool).await?)
    }

    /// Close both pools.
    pub async fn close(&self) {
        self.pool.close().await;
        self.write_pool.close().await;
    }
}
