//! Bounded pool of backing-store connections
//!
//! The pool owns every idle connection and lends each one to exactly one
//! operation at a time through a [`PooledConnection`] guard. Capacity is
//! bounded by a semaphore with `max_size` permits: a guard holds a permit for
//! as long as it is alive, so at most `max_size` connections are ever in use
//! and callers beyond that wait (up to `acquire_timeout`) for a release.

use std::{
    collections::VecDeque,
    fmt,
    ops::{Deref, DerefMut},
    str::FromStr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use sqlx::{
    ConnectOptions, Connection,
    sqlite::{SqliteConnectOptions, SqliteConnection},
};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore},
    time,
};
use tracing::{debug, info, instrument, warn};

use crate::config::PoolConfig;
use crate::error::{AppError, Result, is_connection_error};
use crate::logging::OperationTimer;

/// An idle connection with tracking metadata
struct IdleConnection {
    id: u64,
    conn: SqliteConnection,
    created_at: Instant,
    idle_since: Instant,
}

impl IdleConnection {
    fn is_expired(&self, max_lifetime: Option<Duration>) -> bool {
        max_lifetime.is_some_and(|lifetime| self.created_at.elapsed() >= lifetime)
    }

    fn is_idle_too_long(&self, idle_timeout: Option<Duration>) -> bool {
        idle_timeout.is_some_and(|timeout| self.idle_since.elapsed() >= timeout)
    }
}

#[derive(Default)]
struct PoolState {
    /// Connections available for checkout; the front has been idle longest
    idle: VecDeque<IdleConnection>,
    /// Live connections: idle, checked out, or being validated
    total: usize,
}

struct PoolInner {
    config: PoolConfig,
    connect_options: SqliteConnectOptions,
    state: Mutex<PoolState>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    next_id: AtomicU64,
    #[cfg(test)]
    failing_pings: std::sync::atomic::AtomicUsize,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        // The state holds no invariants a panicking holder could break halfway
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forget_connection(&self) {
        let mut state = self.state();
        state.total = state.total.saturating_sub(1);
    }

    /// Open a new connection, counting it against the pool before connecting
    async fn open(&self) -> Result<(u64, SqliteConnection)> {
        self.state().total += 1;
        let attempt = time::timeout(self.config.validation_timeout, self.connect_options.connect()).await;
        match attempt {
            Ok(Ok(conn)) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                debug!(pool = %self.config.name, connection_id = id, "Opened new connection");
                Ok((id, conn))
            }
            Ok(Err(e)) => {
                self.forget_connection();
                Err(AppError::ConnectionUnavailable(e))
            }
            Err(_) => {
                self.forget_connection();
                Err(AppError::ConnectionUnavailable(sqlx::Error::PoolTimedOut))
            }
        }
    }

    /// Cheap liveness check bounded by `validation_timeout`
    async fn ping(&self, conn: &mut SqliteConnection) -> bool {
        #[cfg(test)]
        if self
            .failing_pings
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return false;
        }

        matches!(
            time::timeout(self.config.validation_timeout, conn.ping()).await,
            Ok(Ok(()))
        )
    }

    fn retire(&self, conn: SqliteConnection, id: u64, reason: &str) {
        self.forget_connection();
        debug!(pool = %self.config.name, connection_id = id, reason, "Retiring connection");
        close_in_background(conn);
    }
}

/// Close a connection without blocking the caller
fn close_in_background(conn: SqliteConnection) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            if let Err(e) = conn.close().await {
                debug!("Error closing retired connection: {}", e);
            }
        });
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max_size: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} in use, {} idle, max {}",
            self.in_use, self.total, self.idle, self.max_size
        )
    }
}

/// Outcome of one keep-alive pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Idle connections that answered a ping and went back to the pool
    pub validated: usize,
    /// Connections closed because of age or idleness
    pub retired: usize,
    /// Connections discarded because they failed validation
    pub broken: usize,
    /// Connections opened to restore `min_idle`
    pub opened: usize,
}

impl fmt::Display for MaintenanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} validated, {} retired, {} broken, {} opened",
            self.validated, self.retired, self.broken, self.opened
        )
    }
}

/// Bounded pool of SQLite connections
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.inner.config.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    /// Open a pool against the given sqlx connection string.
    ///
    /// Opens `min_idle` connections and validates one of them. Failure here is
    /// meant to be fatal to the host: it retries `startup_attempts` times
    /// before returning `ConnectionUnavailable`.
    #[instrument(skip(url, config), fields(pool = %config.name))]
    pub async fn connect(url: &str, config: PoolConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url).map_err(AppError::ConnectionUnavailable)?;
        Self::connect_with(options, config).await
    }

    /// Open a pool from prepared connect options
    pub async fn connect_with(options: SqliteConnectOptions, config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let pool = Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(config.max_size)),
                connect_options: options,
                state: Mutex::new(PoolState::default()),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                #[cfg(test)]
                failing_pings: std::sync::atomic::AtomicUsize::new(0),
                config,
            }),
        };

        let attempts = pool.inner.config.startup_attempts;
        let mut last_error = None;
        for attempt in 1..=attempts {
            match pool.warm_up().await {
                Ok(()) => {
                    info!(
                        pool = %pool.inner.config.name,
                        "Connection pool ready: {}",
                        pool.stats()
                    );
                    return Ok(pool);
                }
                Err(e) => {
                    warn!(
                        pool = %pool.inner.config.name,
                        "Backing store unreachable (attempt {}/{}): {}",
                        attempt, attempts, e
                    );
                    last_error = Some(e);
                    if attempt < attempts {
                        time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                    }
                }
            }
        }

        pool.shutdown().await;
        Err(last_error.unwrap_or_else(|| AppError::ConnectionUnavailable(sqlx::Error::PoolClosed)))
    }

    /// Open the initial connections and prove the store answers
    async fn warm_up(&self) -> Result<()> {
        let mut conn = self.acquire().await?;
        if !self.validate(&mut conn).await {
            return Err(AppError::ConnectionUnavailable(sqlx::Error::Protocol(
                "connection failed validation".to_string(),
            )));
        }
        drop(conn);
        self.fill_min_idle().await?;
        Ok(())
    }

    /// Borrow a connection, waiting at most `acquire_timeout` for capacity
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(AppError::ConnectionUnavailable(sqlx::Error::PoolClosed));
        }

        let started = Instant::now();
        let permit = match time::timeout(inner.config.acquire_timeout, inner.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(AppError::ConnectionUnavailable(sqlx::Error::PoolClosed)),
            Err(_) => {
                warn!(
                    pool = %inner.config.name,
                    "No connection became free within {:?}: {}",
                    inner.config.acquire_timeout,
                    self.stats()
                );
                return Err(AppError::PoolExhausted {
                    waited: started.elapsed(),
                });
            }
        };

        loop {
            let idle = inner.state().idle.pop_back();
            let Some(mut idle) = idle else {
                break;
            };

            if idle.is_expired(inner.config.max_lifetime) {
                inner.retire(idle.conn, idle.id, "max lifetime reached");
                continue;
            }
            if inner.config.test_before_acquire && !inner.ping(&mut idle.conn).await {
                inner.forget_connection();
                warn!(pool = %inner.config.name, connection_id = idle.id, "Discarding connection that failed validation");
                drop(idle.conn);
                continue;
            }

            return Ok(PooledConnection::new(self.inner.clone(), permit, idle.id, idle.conn, idle.created_at));
        }

        let (id, conn) = inner.open().await?;
        Ok(PooledConnection::new(self.inner.clone(), permit, id, conn, Instant::now()))
    }

    /// Return a connection to the pool; equivalent to dropping the guard
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Liveness check; a connection that fails is marked broken and will be
    /// discarded on release instead of handed out again
    pub async fn validate(&self, conn: &mut PooledConnection) -> bool {
        let alive = match conn.conn.as_mut() {
            Some(raw) => self.inner.ping(raw).await,
            None => false,
        };
        if !alive {
            conn.mark_broken();
        }
        alive
    }

    /// Keep-alive pass over idle connections.
    ///
    /// Each idle connection is checked out under a permit, so maintenance never
    /// pushes the pool above `max_size`. Connections busy with real work are
    /// left alone.
    #[instrument(skip(self), fields(pool = %self.inner.config.name))]
    pub async fn maintain(&self) -> MaintenanceReport {
        let timer = OperationTimer::start("pool maintenance");
        let inner = &self.inner;
        let mut report = MaintenanceReport::default();

        let to_check = inner.state().idle.len();
        for _ in 0..to_check {
            if inner.closed.load(Ordering::Acquire) {
                break;
            }
            let Ok(permit) = inner.permits.clone().try_acquire_owned() else {
                break;
            };

            let popped = {
                let mut state = inner.state();
                let Some(idle) = state.idle.pop_front() else {
                    break;
                };
                let above_min = state.total > inner.config.min_idle;
                (idle, above_min)
            };
            let (mut idle, above_min) = popped;

            if idle.is_expired(inner.config.max_lifetime) {
                inner.retire(idle.conn, idle.id, "max lifetime reached");
                report.retired += 1;
            } else if above_min && idle.is_idle_too_long(inner.config.idle_timeout) {
                inner.retire(idle.conn, idle.id, "idle timeout");
                report.retired += 1;
            } else if inner.ping(&mut idle.conn).await {
                inner.state().idle.push_back(idle);
                report.validated += 1;
            } else {
                inner.forget_connection();
                warn!(connection_id = idle.id, "Idle connection failed keep-alive, discarding");
                report.broken += 1;
            }
            drop(permit);
        }

        match self.fill_min_idle().await {
            Ok(opened) => report.opened = opened,
            Err(e) => warn!("Could not restore minimum idle connections: {}", e),
        }

        timer.finish(report);
        report
    }

    /// Open connections until `min_idle` are live
    async fn fill_min_idle(&self) -> Result<usize> {
        let inner = &self.inner;
        let mut opened = 0;
        loop {
            if inner.closed.load(Ordering::Acquire) || inner.state().total >= inner.config.min_idle {
                return Ok(opened);
            }
            let Ok(permit) = inner.permits.clone().try_acquire_owned() else {
                return Ok(opened);
            };
            let (id, conn) = inner.open().await?;
            let now = Instant::now();
            inner.state().idle.push_back(IdleConnection {
                id,
                conn,
                created_at: now,
                idle_since: now,
            });
            drop(permit);
            opened += 1;
        }
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state();
        PoolStats {
            total: state.total,
            idle: state.idle.len(),
            in_use: state.total.saturating_sub(state.idle.len()),
            max_size: self.inner.config.max_size,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Make the next `count` liveness checks report a dead connection
    #[cfg(test)]
    pub(crate) fn fail_next_pings(&self, count: usize) {
        self.inner.failing_pings.store(count, Ordering::SeqCst);
    }

    /// Close every idle connection and refuse further acquires.
    ///
    /// Idempotent. Connections still checked out are closed as their guards
    /// drop.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let first = !inner.closed.swap(true, Ordering::AcqRel);
        inner.permits.close();

        let idle: Vec<IdleConnection> = {
            let mut state = inner.state();
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            drained
        };
        let closed = idle.len();
        for idle in idle {
            if let Err(e) = idle.conn.close().await {
                debug!(connection_id = idle.id, "Error closing connection: {}", e);
            }
        }

        if first {
            info!(pool = %inner.config.name, "Connection pool closed ({} idle connections)", closed);
        }
    }
}

/// RAII guard for a borrowed connection
///
/// Returns the connection to the pool when dropped, unless it was marked
/// broken, outlived `max_lifetime`, or the pool has shut down.
pub struct PooledConnection {
    conn: Option<SqliteConnection>,
    id: u64,
    created_at: Instant,
    broken: bool,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn new(
        pool: Arc<PoolInner>,
        permit: OwnedSemaphorePermit,
        id: u64,
        conn: SqliteConnection,
        created_at: Instant,
    ) -> Self {
        Self {
            conn: Some(conn),
            id,
            created_at,
            broken: false,
            pool,
            _permit: permit,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Flag the connection so it is discarded instead of reused
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Convert a sqlx error, marking the connection broken when the error
    /// means the transport can no longer be trusted
    pub fn observe(&mut self, err: sqlx::Error) -> AppError {
        if is_connection_error(&err) {
            self.mark_broken();
        }
        AppError::from(err)
    }
}

impl Deref for PooledConnection {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        // Only taken in Drop
        self.conn.as_ref().expect("connection already returned to pool")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection already returned to pool")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let pool = &self.pool;

        if self.broken {
            pool.forget_connection();
            warn!(pool = %pool.config.name, connection_id = self.id, "Discarding broken connection");
            drop(conn);
        } else if pool.closed.load(Ordering::Acquire) {
            pool.retire(conn, self.id, "pool closed");
        } else if pool
            .config
            .max_lifetime
            .is_some_and(|lifetime| self.created_at.elapsed() >= lifetime)
        {
            pool.retire(conn, self.id, "max lifetime reached");
        } else {
            pool.state().idle.push_back(IdleConnection {
                id: self.id,
                conn,
                created_at: self.created_at,
                idle_since: Instant::now(),
            });
        }
        // The permit is released after this body runs, once the connection is back
    }
}
