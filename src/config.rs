//! Runtime configuration for the player store
//!
//! Every tunable the pool, cache and flusher read lives here. Values come
//! from the environment (optionally seeded from a `.env` file) and fall back
//! to defaults sized for a single game server.

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use tracing::warn;
use url::Url;

use crate::error::{AppError, Result};

const DATA_DIR_NAME: &str = "mcprison";

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Name used in log output
    pub name: String,
    /// Maximum number of live connections
    pub max_size: usize,
    /// Connections kept open even when idle
    pub min_idle: usize,
    /// Longest a caller waits for a free connection
    pub acquire_timeout: Duration,
    /// Idle connections above `min_idle` are retired after this long
    pub idle_timeout: Option<Duration>,
    /// Connections are retired after this age regardless of health
    pub max_lifetime: Option<Duration>,
    /// Upper bound on a liveness check
    pub validation_timeout: Duration,
    /// Ping idle connections before handing them out
    pub test_before_acquire: bool,
    /// Connection attempts made by `ConnectionPool::connect` before giving up
    pub startup_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "players-pool".to_string(),
            max_size: 10,
            min_idle: 2,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(1800)),
            validation_timeout: Duration::from_secs(5),
            test_before_acquire: true,
            startup_attempts: 3,
        }
    }
}

impl PoolConfig {
    /// Set maximum connections
    pub fn max_size(mut self, max: usize) -> Self {
        self.max_size = max;
        self
    }

    /// Set minimum idle connections
    pub fn min_idle(mut self, min: usize) -> Self {
        self.min_idle = min;
        self
    }

    /// Set acquire timeout
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set idle timeout
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set maximum lifetime
    pub fn max_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set number of startup attempts
    pub fn startup_attempts(mut self, attempts: u32) -> Self {
        self.startup_attempts = attempts;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(AppError::configuration("pool max_size must be > 0"));
        }
        if self.min_idle > self.max_size {
            return Err(AppError::configuration("pool min_idle cannot exceed max_size"));
        }
        if self.startup_attempts == 0 {
            return Err(AppError::configuration("pool startup_attempts must be > 0"));
        }
        Ok(())
    }
}

/// Entity cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a waiter blocks on an in-flight load; `None` waits indefinitely
    pub load_timeout: Option<Duration>,
    /// How long a clean entry survives after its session ends
    pub eviction_grace: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            load_timeout: None,
            eviction_grace: Duration::from_secs(300),
        }
    }
}

/// Flusher configuration
#[derive(Debug, Clone)]
pub struct FlushConfig {
    /// Period between flush passes
    pub interval: Duration,
    /// Period between pool keep-alive passes
    pub keep_alive_interval: Duration,
    /// Saves allowed in flight at once during a pass
    pub concurrency: usize,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(20),
            keep_alive_interval: Duration::from_secs(60),
            concurrency: 4,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// sqlx connection string for the backing store
    pub database_url: String,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub flush: FlushConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            flush: FlushConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the environment, reading `.env` first if present
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let pool = PoolConfig {
            name: defaults.pool.name.clone(),
            max_size: parse_var(&lookup, "PLAYERS_POOL_MAX_SIZE")?.unwrap_or(defaults.pool.max_size),
            min_idle: parse_var(&lookup, "PLAYERS_POOL_MIN_IDLE")?.unwrap_or(defaults.pool.min_idle),
            acquire_timeout: parse_var(&lookup, "PLAYERS_POOL_ACQUIRE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.pool.acquire_timeout),
            idle_timeout: parse_var(&lookup, "PLAYERS_POOL_IDLE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .or(defaults.pool.idle_timeout),
            max_lifetime: parse_var(&lookup, "PLAYERS_POOL_MAX_LIFETIME_SECS")?
                .map(Duration::from_secs)
                .or(defaults.pool.max_lifetime),
            validation_timeout: parse_var(&lookup, "PLAYERS_POOL_VALIDATION_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.pool.validation_timeout),
            test_before_acquire: defaults.pool.test_before_acquire,
            startup_attempts: parse_var(&lookup, "PLAYERS_POOL_STARTUP_ATTEMPTS")?
                .unwrap_or(defaults.pool.startup_attempts),
        };

        let cache = CacheConfig {
            load_timeout: parse_var(&lookup, "PLAYERS_CACHE_LOAD_TIMEOUT_MS")?.map(Duration::from_millis),
            eviction_grace: parse_var(&lookup, "PLAYERS_CACHE_EVICTION_GRACE_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache.eviction_grace),
        };

        let flush = FlushConfig {
            interval: parse_var(&lookup, "PLAYERS_FLUSH_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.flush.interval),
            keep_alive_interval: parse_var(&lookup, "PLAYERS_KEEPALIVE_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.flush.keep_alive_interval),
            concurrency: parse_var(&lookup, "PLAYERS_FLUSH_CONCURRENCY")?.unwrap_or(defaults.flush.concurrency),
        };

        let config = Self {
            database_url: lookup("PLAYERS_DATABASE_URL").unwrap_or(defaults.database_url),
            pool,
            cache,
            flush,
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            return Err(AppError::configuration("database url cannot be empty"));
        }
        self.pool.validate()?;
        if self.flush.interval.is_zero() || self.flush.keep_alive_interval.is_zero() {
            return Err(AppError::configuration("flush intervals must be non-zero"));
        }
        if self.flush.concurrency == 0 {
            return Err(AppError::configuration("flush concurrency must be > 0"));
        }
        Ok(())
    }

    /// The database url with any password replaced, for log output
    pub fn redacted_database_url(&self) -> String {
        match Url::parse(&self.database_url) {
            Ok(mut url) if url.password().is_some() => {
                // set_password only fails for cannot-be-a-base urls, which carry no password
                let _ = url.set_password(Some("***"));
                url.to_string()
            }
            _ => self.database_url.clone(),
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| AppError::configuration(format!("{name}={raw:?}: {e}"))),
        _ => Ok(None),
    }
}

/// Default store location inside the platform data directory
fn default_database_url() -> String {
    let mut path = match dirs::data_dir() {
        Some(dir) => dir,
        None => {
            warn!("Could not determine data directory. Using the current directory.");
            PathBuf::from(".")
        }
    };
    path.push(DATA_DIR_NAME);
    path.push("players.db");
    format!("sqlite://{}?mode=rwc", path.display())
}
