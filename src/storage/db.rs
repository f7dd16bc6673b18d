use std::str::FromStr;

use sqlx::{
    migrate::Migrator,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous},
};
use tracing::{info, instrument};

use crate::config::PoolConfig;
use crate::error::{AppError, Result};
use crate::storage::pool::ConnectionPool;

/// Schema migrations embedded at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Connect options for a SQLite store at the given url
pub fn connect_options(url: &str) -> Result<SqliteConnectOptions> {
    let options = SqliteConnectOptions::from_str(url).map_err(AppError::ConnectionUnavailable)?;
    // WAL is meaningless for in-memory databases and SQLite rejects it there
    let options = if url.contains(":memory:") || url.contains("mode=memory") {
        options
    } else {
        if let Some(dir) = options.get_filename().parent() {
            std::fs::create_dir_all(dir).map_err(|e| {
                AppError::configuration(format!("cannot create data directory {}: {}", dir.display(), e))
            })?;
        }
        options
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            // Only use NORMAL if WAL mode is enabled
            // as it provides extra performance benefits
            // at the cost of durability
            .synchronous(SqliteSynchronous::Normal)
    };
    Ok(options)
}

/// Open the pool for the configured store
#[instrument(skip(url, config))]
pub async fn open_pool(url: &str, config: PoolConfig) -> Result<ConnectionPool> {
    ConnectionPool::connect_with(connect_options(url)?, config).await
}

/// Apply any pending schema migrations on one borrowed connection
#[instrument(skip(pool))]
pub async fn migrate(pool: &ConnectionPool) -> Result<()> {
    let mut conn = pool.acquire().await?;
    MIGRATOR.run(&mut *conn).await?;
    info!("Schema migrations applied ({} known)", MIGRATOR.iter().count());
    Ok(())
}

/// Setup an in-memory store with the schema applied
#[cfg(test)]
pub(crate) async fn setup_test_db(config: PoolConfig) -> ConnectionPool {
    let pool = open_pool("sqlite::memory:", config)
        .await
        .expect("Failed to initialize database");
    migrate(&pool).await.expect("Failed to run migrations");
    pool
}
