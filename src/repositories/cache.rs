//! Entity cache with per-key load coalescing
//!
//! The cache maps an entity key to the single shared instance every caller
//! mutates. A miss installs a `Loading` slot holding a watch receiver and
//! spawns the repository lookup; later callers for the same key subscribe to
//! that receiver instead of querying again. The slot map is only locked
//! around slot transitions, never across I/O, so different keys never block
//! each other.
//!
//! Dirty tracking is generation based: every `mark_dirty` bumps the entry's
//! generation and the flusher may only clear the flag for the generation it
//! actually saved.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::{
    sync::{RwLock, watch},
    time,
};
use tracing::{debug, instrument, warn};

use crate::{
    config::CacheConfig,
    entities::Player,
    error::{AppError, Result},
    repositories::{
        base::{Entity, Lookup, Repository},
        player_repository::PlayerRepository,
    },
};

/// A cached instance shared by every caller holding the same key
pub type Shared<T> = Arc<RwLock<T>>;

/// Cache of online players backed by the SQL repository
pub type PlayerCache = EntityCache<Player, PlayerRepository>;

type LoadOutcome<T> = Result<Lookup<Shared<T>>, Arc<AppError>>;

/// Cache entry with metadata
struct CachedEntry<T> {
    value: Shared<T>,
    /// Bumped on every mutation notice
    generation: u64,
    dirty: bool,
    /// `None` while the owning session is active
    offline_since: Option<Instant>,
}

impl<T> CachedEntry<T> {
    fn loaded(value: Shared<T>) -> Self {
        Self {
            value,
            generation: 0,
            dirty: false,
            offline_since: Some(Instant::now()),
        }
    }

    fn created(value: Shared<T>) -> Self {
        Self {
            value,
            generation: 1,
            dirty: true,
            offline_since: Some(Instant::now()),
        }
    }

    fn touch_dirty(&mut self) {
        self.generation += 1;
        self.dirty = true;
    }
}

enum Slot<T> {
    Loading {
        load_id: u64,
        done: watch::Receiver<Option<LoadOutcome<T>>>,
    },
    Loaded(CachedEntry<T>),
}

/// A dirty entry as seen by one flush pass
#[derive(Debug)]
pub struct DirtyEntry<T: Entity> {
    pub key: T::Key,
    pub value: Shared<T>,
    /// Pass this back to [`EntityCache::mark_clean`] after a successful save
    pub generation: u64,
}

/// Result of an eviction request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    Evicted,
    /// Refused: the entry has unsaved mutations
    Dirty,
    /// Refused: a load for the key is still in flight
    Loading,
    Absent,
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub loaded: usize,
    pub loading: usize,
    pub dirty: usize,
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub load_failures: u64,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loaded={}, loading={}, dirty={}, hits={}, misses={}, loads={}, load_failures={}",
            self.loaded, self.loading, self.dirty, self.hits, self.misses, self.loads, self.load_failures
        )
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_failures: AtomicU64,
}

struct CacheInner<T: Entity, R> {
    repository: Arc<R>,
    config: CacheConfig,
    slots: Mutex<HashMap<T::Key, Slot<T>>>,
    next_load_id: AtomicU64,
    counters: Counters,
}

impl<T, R> CacheInner<T, R>
where
    T: Entity,
    R: Repository<T>,
{
    fn lock_slots(&self) -> MutexGuard<'_, HashMap<T::Key, Slot<T>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the result of load `load_id` into the slot map.
    ///
    /// An instance installed with `put` while the load ran takes precedence
    /// over the loaded one. If the slot no longer belongs to this load the
    /// result is handed to its waiters without being installed.
    fn finish_load(&self, key: &T::Key, load_id: u64, result: Result<Lookup<T>>) -> LoadOutcome<T> {
        let mut slots = self.lock_slots();
        let owned = match slots.get(key) {
            Some(Slot::Loaded(entry)) => {
                debug!("{} {} was installed during its load", T::KIND, key);
                return Ok(Lookup::Found(entry.value.clone()));
            }
            Some(Slot::Loading { load_id: id, .. }) => *id == load_id,
            None => false,
        };

        match result {
            Ok(Lookup::Found(entity)) => {
                let value = Arc::new(RwLock::new(entity));
                if owned {
                    slots.insert(key.clone(), Slot::Loaded(CachedEntry::loaded(value.clone())));
                }
                debug!("Loaded {} {}", T::KIND, key);
                Ok(Lookup::Found(value))
            }
            Ok(Lookup::NotFound) => {
                if owned {
                    slots.remove(key);
                }
                Ok(Lookup::NotFound)
            }
            Err(e) => {
                if owned {
                    slots.remove(key);
                }
                self.counters.load_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to load {} {}: {}", T::KIND, key, e);
                Err(Arc::new(e))
            }
        }
    }

    fn abandon_load(&self, key: &T::Key, load_id: u64) {
        let mut slots = self.lock_slots();
        if matches!(slots.get(key), Some(Slot::Loading { load_id: id, .. }) if *id == load_id) {
            slots.remove(key);
            warn!("Load of {} {} was abandoned", T::KIND, key);
        }
    }
}

/// Clears a `Loading` slot if the load task ends without publishing
struct LoadGuard<T: Entity, R: Repository<T>> {
    inner: Arc<CacheInner<T, R>>,
    key: T::Key,
    load_id: u64,
    armed: bool,
}

impl<T: Entity, R: Repository<T>> Drop for LoadGuard<T, R> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.abandon_load(&self.key, self.load_id);
        }
    }
}

/// In-memory owner of the live entity instances of one kind.
///
/// Cloning the cache clones a handle; all clones share the same entries.
pub struct EntityCache<T: Entity, R: Repository<T>> {
    inner: Arc<CacheInner<T, R>>,
}

impl<T: Entity, R: Repository<T>> Clone for EntityCache<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Entity, R: Repository<T>> fmt::Debug for EntityCache<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityCache")
            .field("kind", &T::KIND)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T, R> EntityCache<T, R>
where
    T: Entity,
    R: Repository<T>,
{
    /// Create an empty cache in front of `repository`
    pub fn new(repository: Arc<R>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                repository,
                config,
                slots: Mutex::new(HashMap::new()),
                next_load_id: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.inner.repository
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Get the shared instance for `key`, loading it if needed.
    ///
    /// A loaded entry is returned without I/O. Otherwise the caller waits
    /// for the single in-flight load of the key, starting it if there is
    /// none. Load failures reach every waiter as [`AppError::Unavailable`]
    /// and leave the key free to be loaded again.
    #[instrument(skip(self), fields(kind = T::KIND))]
    pub async fn get(&self, key: &T::Key) -> Result<Lookup<Shared<T>>> {
        let done = {
            let mut slots = self.inner.lock_slots();
            match slots.get(key) {
                Some(Slot::Loaded(entry)) => {
                    self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Lookup::Found(entry.value.clone()));
                }
                Some(Slot::Loading { done, .. }) => {
                    self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                    debug!("Waiting on in-flight load of {}", key);
                    done.clone()
                }
                None => {
                    self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
                    self.start_load(&mut slots, key)
                }
            }
        };

        self.await_load(key, done).await
    }

    fn start_load(
        &self,
        slots: &mut HashMap<T::Key, Slot<T>>,
        key: &T::Key,
    ) -> watch::Receiver<Option<LoadOutcome<T>>> {
        let load_id = self.inner.next_load_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        slots.insert(
            key.clone(),
            Slot::Loading {
                load_id,
                done: rx.clone(),
            },
        );
        self.inner.counters.loads.fetch_add(1, Ordering::Relaxed);

        // Waiters only hold receivers, so dropping them never cancels the load
        let inner = Arc::clone(&self.inner);
        let key = key.clone();
        tokio::spawn(async move {
            let mut guard = LoadGuard {
                inner: Arc::clone(&inner),
                key: key.clone(),
                load_id,
                armed: true,
            };
            let result = inner.repository.find_by_key(&key).await;
            let outcome = inner.finish_load(&key, load_id, result);
            guard.armed = false;
            tx.send_replace(Some(outcome));
        });

        rx
    }

    async fn await_load(
        &self,
        key: &T::Key,
        mut done: watch::Receiver<Option<LoadOutcome<T>>>,
    ) -> Result<Lookup<Shared<T>>> {
        let wait = async move {
            done.wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|outcome| (*outcome).clone())
        };

        let outcome = match self.inner.config.load_timeout {
            Some(limit) => time::timeout(limit, wait).await.map_err(|_| {
                warn!("Gave up waiting for {} {} after {:?}", T::KIND, key, limit);
                AppError::LoadTimeout {
                    key: key.to_string(),
                    waited: limit,
                }
            })?,
            None => wait.await,
        };

        match outcome {
            Some(Ok(lookup)) => Ok(lookup),
            Some(Err(cause)) => Err(AppError::unavailable(key, cause)),
            None => Err(AppError::unavailable(
                key,
                Arc::new(AppError::LoadInterrupted(key.to_string())),
            )),
        }
    }

    /// Get the instance for `key`, creating and installing it with `make` if
    /// the store has no record.
    ///
    /// Concurrent callers for the same unknown key all receive the one
    /// instance that got installed; `make` runs at most once per call.
    #[instrument(skip(self, make), fields(kind = T::KIND))]
    pub async fn get_or_create<F>(&self, key: &T::Key, make: F) -> Result<Shared<T>>
    where
        F: FnOnce() -> Result<T> + Send,
    {
        let mut make = Some(make);
        loop {
            if let Lookup::Found(value) = self.get(key).await? {
                return Ok(value);
            }

            let installed = {
                let mut slots = self.inner.lock_slots();
                match slots.get(key) {
                    Some(Slot::Loaded(entry)) => Some(entry.value.clone()),
                    // Someone else started a load after our NotFound; wait on it
                    Some(Slot::Loading { .. }) => None,
                    None => {
                        let entity = match make.take() {
                            Some(make) => make()?,
                            None => return Err(AppError::LoadInterrupted(key.to_string())),
                        };
                        if entity.key() != *key {
                            return Err(AppError::validation(format!(
                                "created {} has key {}, expected {}",
                                T::KIND,
                                entity.key(),
                                key
                            )));
                        }
                        let value = Arc::new(RwLock::new(entity));
                        slots.insert(key.clone(), Slot::Loaded(CachedEntry::created(value.clone())));
                        debug!("Created new {} {}", T::KIND, key);
                        Some(value)
                    }
                }
            };

            if let Some(value) = installed {
                return Ok(value);
            }
        }
    }

    /// Install `entity` as the live instance for its key and mark it dirty.
    ///
    /// A load in flight for the key will hand this instance to its waiters.
    pub fn put(&self, entity: T) -> Shared<T> {
        let key = entity.key();
        let value = Arc::new(RwLock::new(entity));
        let mut slots = self.inner.lock_slots();
        match slots.get_mut(&key) {
            Some(Slot::Loaded(entry)) => {
                entry.value = value.clone();
                entry.touch_dirty();
            }
            _ => {
                slots.insert(key.clone(), Slot::Loaded(CachedEntry::created(value.clone())));
            }
        }
        debug!("Installed {} {}", T::KIND, key);
        value
    }

    /// Note that the instance for `key` has unsaved mutations.
    ///
    /// Returns false, doing nothing, when the key is not loaded.
    pub fn mark_dirty(&self, key: &T::Key) -> bool {
        let mut slots = self.inner.lock_slots();
        match slots.get_mut(key) {
            Some(Slot::Loaded(entry)) => {
                entry.touch_dirty();
                true
            }
            _ => false,
        }
    }

    /// Clear the dirty flag after `generation` was saved.
    ///
    /// Returns false if the entry was marked dirty again since that
    /// generation was snapshotted; it then stays dirty for the next pass.
    pub fn mark_clean(&self, key: &T::Key, generation: u64) -> bool {
        let mut slots = self.inner.lock_slots();
        match slots.get_mut(key) {
            Some(Slot::Loaded(entry)) if entry.generation == generation => {
                entry.dirty = false;
                true
            }
            _ => false,
        }
    }

    pub fn is_dirty(&self, key: &T::Key) -> bool {
        matches!(self.inner.lock_slots().get(key), Some(Slot::Loaded(entry)) if entry.dirty)
    }

    /// Whether `key` is loaded (not merely loading)
    pub fn contains(&self, key: &T::Key) -> bool {
        matches!(self.inner.lock_slots().get(key), Some(Slot::Loaded(_)))
    }

    /// The loaded instance for `key`, without loading or waiting
    pub fn peek(&self, key: &T::Key) -> Option<Shared<T>> {
        match self.inner.lock_slots().get(key) {
            Some(Slot::Loaded(entry)) => Some(entry.value.clone()),
            _ => None,
        }
    }

    /// Snapshot every dirty entry with its current generation
    pub fn dirty_entries(&self) -> Vec<DirtyEntry<T>> {
        self.inner
            .lock_slots()
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Loaded(entry) if entry.dirty => Some(DirtyEntry {
                    key: key.clone(),
                    value: entry.value.clone(),
                    generation: entry.generation,
                }),
                _ => None,
            })
            .collect()
    }

    /// Snapshot every loaded entry
    pub fn loaded(&self) -> Vec<(T::Key, Shared<T>)> {
        self.inner
            .lock_slots()
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Loaded(entry) => Some((key.clone(), entry.value.clone())),
                Slot::Loading { .. } => None,
            })
            .collect()
    }

    /// Drop a clean, loaded entry from memory
    pub fn evict(&self, key: &T::Key) -> EvictOutcome {
        let mut slots = self.inner.lock_slots();
        let outcome = match slots.get(key) {
            None => EvictOutcome::Absent,
            Some(Slot::Loading { .. }) => EvictOutcome::Loading,
            Some(Slot::Loaded(entry)) if entry.dirty => EvictOutcome::Dirty,
            Some(Slot::Loaded(_)) => EvictOutcome::Evicted,
        };

        match outcome {
            EvictOutcome::Evicted => {
                slots.remove(key);
                debug!("Evicted {} {}", T::KIND, key);
            }
            EvictOutcome::Dirty => warn!("Refusing to evict dirty {} {}", T::KIND, key),
            _ => {}
        }
        outcome
    }

    /// Apply `f` to the live instance under its write lock and mark it dirty.
    ///
    /// The entry is marked while the write lock is held, so no flush can
    /// snapshot it between the mark and the mutation. If the instance stopped
    /// being the cached one before the lock was taken, the lookup is retried
    /// and `f` runs on the current instance instead.
    #[instrument(skip(self, f), fields(kind = T::KIND))]
    pub async fn update<U>(&self, key: &T::Key, f: impl FnOnce(&mut T) -> U) -> Result<Lookup<U>> {
        loop {
            let Lookup::Found(value) = self.get(key).await? else {
                return Ok(Lookup::NotFound);
            };

            let mut entity = value.write().await;
            if self.mark_instance_dirty(key, &value) {
                return Ok(Lookup::Found(f(&mut *entity)));
            }
            debug!("{} {} was unloaded before it could be updated, retrying", T::KIND, key);
        }
    }

    /// Mark `value` dirty if it is still the cached instance for `key`.
    ///
    /// Returns false when the entry was evicted or replaced; the caller's
    /// instance is then detached and must not be mutated.
    pub fn mark_instance_dirty(&self, key: &T::Key, value: &Shared<T>) -> bool {
        self.with_current(key, value, CachedEntry::touch_dirty)
    }

    /// Record that the owner of `key` is online, pinning `value` against
    /// grace-period eviction.
    ///
    /// Returns false when `value` is no longer the cached instance.
    pub fn session_started(&self, key: &T::Key, value: &Shared<T>) -> bool {
        self.with_current(key, value, |entry| entry.offline_since = None)
    }

    /// Record that the owner of `key` went offline, starting the grace period
    pub fn session_ended(&self, key: &T::Key, value: &Shared<T>) -> bool {
        self.with_current(key, value, |entry| entry.offline_since = Some(Instant::now()))
    }

    fn with_current(&self, key: &T::Key, value: &Shared<T>, f: impl FnOnce(&mut CachedEntry<T>)) -> bool {
        let mut slots = self.inner.lock_slots();
        match slots.get_mut(key) {
            Some(Slot::Loaded(entry)) if Arc::ptr_eq(&entry.value, value) => {
                f(entry);
                true
            }
            _ => false,
        }
    }

    /// Evict clean entries whose owner has been offline for at least `grace`
    pub fn evict_expired(&self, grace: Duration) -> usize {
        let now = Instant::now();
        let mut slots = self.inner.lock_slots();
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Loaded(entry) if !entry.dirty => {
                !matches!(entry.offline_since, Some(since) if now.duration_since(since) >= grace)
            }
            _ => true,
        });
        let evicted = before - slots.len();
        if evicted > 0 {
            debug!("Evicted {} expired {} entries", evicted, T::KIND);
        }
        evicted
    }

    /// Drop whatever is cached for `key`, dirty or not.
    ///
    /// Only for administrative deletes, where the unsaved state is meant to
    /// disappear along with the stored row.
    pub fn forget(&self, key: &T::Key) -> bool {
        let removed = self.inner.lock_slots().remove(key).is_some();
        if removed {
            debug!("Forgot {} {}", T::KIND, key);
        }
        removed
    }

    /// Number of loaded entries
    pub fn len(&self) -> usize {
        self.stats().loaded
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            hits: self.inner.counters.hits.load(Ordering::Relaxed),
            misses: self.inner.counters.misses.load(Ordering::Relaxed),
            loads: self.inner.counters.loads.load(Ordering::Relaxed),
            load_failures: self.inner.counters.load_failures.load(Ordering::Relaxed),
            ..CacheStats::default()
        };
        for slot in self.inner.lock_slots().values() {
            match slot {
                Slot::Loading { .. } => stats.loading += 1,
                Slot::Loaded(entry) => {
                    stats.loaded += 1;
                    if entry.dirty {
                        stats.dirty += 1;
                    }
                }
            }
        }
        stats
    }
}
