pub mod config;
pub mod entities;
pub mod error;
pub mod logging;
pub mod repositories;
pub mod sessions;
pub mod storage;

use std::sync::Arc;

use color_eyre::eyre::WrapErr;
use tracing::{info, warn};

use crate::{
    config::AppConfig,
    repositories::{EntityCache, Flusher, PlayerCache, PlayerRepository},
    sessions::PlayerSessions,
    storage::db,
};

/// Start the player store and run until interrupted.
///
/// Any failure to reach the backing store or to migrate it aborts startup.
/// On ctrl-c the flusher is stopped and drained before the pool closes.
pub async fn run() -> color_eyre::Result<()> {
    color_eyre::install()?;
    logging::init();

    let config = AppConfig::from_env().wrap_err("Invalid configuration")?;
    info!("Opening player store at {}", config.redacted_database_url());

    let pool = db::open_pool(&config.database_url, config.pool.clone())
        .await
        .wrap_err("Backing store unreachable, refusing to start")?;
    if let Err(e) = db::migrate(&pool).await {
        e.log();
        pool.shutdown().await;
        return Err(e).wrap_err("Failed to run migrations");
    }

    let repository = Arc::new(PlayerRepository::new(pool.clone()));
    let cache: PlayerCache = EntityCache::new(repository, config.cache.clone());
    let sessions = PlayerSessions::new(cache.clone());
    let flusher = Flusher::new(cache, pool.clone(), config.flush.clone()).start();

    match sessions.cache().repository().count().await {
        Ok(stored) => info!("Player store ready ({} players stored)", stored),
        Err(e) => warn!("Player store ready, but counting stored players failed: {}", e),
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for shutdown signal: {}", e);
    }

    info!("Shutting down player store");
    let report = flusher.shutdown().await;
    pool.shutdown().await;
    info!("Player store stopped: {}; {}", report, sessions.cache().stats());

    Ok(())
}
