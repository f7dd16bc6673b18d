//! Test utilities for repositories
//!
//! This module provides utilities for testing repositories, the cache and the
//! flusher, including test data generation, verification helpers and an
//! in-memory repository with failure injection.

mod flusher_test;
mod player_repository_test;

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::config::{CacheConfig, PoolConfig};
use crate::entities::Player;
use crate::error::{AppError, Result};
use crate::repositories::base::{Lookup, Repository};
use crate::repositories::cache::EntityCache;
use crate::storage::{ConnectionPool, db};

/// Initialize an in-memory database for testing
pub async fn setup_test_db() -> ConnectionPool {
    db::setup_test_db(test_pool_config()).await
}

/// Pool settings for tests: small, with one connection always open so the
/// in-memory database outlives any single borrow
pub fn test_pool_config() -> PoolConfig {
    PoolConfig::default()
        .max_size(4)
        .min_idle(1)
        .acquire_timeout(Duration::from_secs(5))
}

/// Cache over a fresh mock repository
pub fn mock_cache(config: CacheConfig) -> (EntityCache<Player, MockPlayerRepository>, Arc<MockPlayerRepository>) {
    let repo = Arc::new(MockPlayerRepository::default());
    (EntityCache::new(Arc::clone(&repo), config), repo)
}

/// Test data generator for repositories
pub mod generators {
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    use crate::entities::{Balance, Player};

    /// Generate a test player with the given uuid
    pub fn player(uuid: Uuid) -> Player {
        let name = format!("p_{}", &uuid.simple().to_string()[..8]);
        let mut player = Player::new(uuid, &name).expect("generated name is valid");
        player.balance = Balance::from_cents(12_345);
        player.set_rank("C").expect("generated rank is valid");
        player.prison_xp = 420;
        player.prestige = 1;
        player.last_seen = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap());
        player
    }

    /// Generate a batch of test players
    pub fn players(count: usize) -> Vec<Player> {
        (0..count).map(|_| player(Uuid::new_v4())).collect()
    }

    /// Generate a player whose name would break a query built by concatenation
    pub fn hostile_player(uuid: Uuid) -> Player {
        let mut player = player(uuid);
        player.rename("x' OR '1'='1").expect("hostile name fits the length limit");
        player
    }
}

/// Assertion helpers for repository tests
pub mod assertions {
    use uuid::Uuid;

    use crate::entities::{Balance, Player};
    use crate::error::Result;
    use crate::repositories::{Lookup, PlayerRepository, Repository};

    /// Assert that a player is stored
    pub async fn assert_player_stored(repo: &PlayerRepository, uuid: &Uuid) -> Result<Player> {
        match repo.find_by_key(uuid).await? {
            Lookup::Found(player) => Ok(player),
            Lookup::NotFound => panic!("Player {} should be stored", uuid),
        }
    }

    /// Assert that a player is not stored
    pub async fn assert_player_not_stored(repo: &PlayerRepository, uuid: &Uuid) -> Result<()> {
        let lookup = repo.find_by_key(uuid).await?;
        assert!(!lookup.is_found(), "Player {} should not be stored", uuid);
        Ok(())
    }

    /// Assert the stored balance of a player
    pub async fn assert_stored_balance(repo: &PlayerRepository, uuid: &Uuid, expected: Balance) -> Result<()> {
        let player = assert_player_stored(repo, uuid).await?;
        assert_eq!(player.balance, expected, "Stored balance of {} mismatch", uuid);
        Ok(())
    }

    /// Assert that the repository holds the expected number of players
    pub async fn assert_player_count(repo: &PlayerRepository, expected: i64) -> Result<()> {
        let count = repo.count().await?;
        assert_eq!(count, expected, "Expected {} players, found {}", expected, count);
        Ok(())
    }
}

/// In-memory player repository with call counters and failure injection
#[derive(Default)]
pub struct MockPlayerRepository {
    rows: Mutex<HashMap<Uuid, Player>>,
    find_calls: AtomicUsize,
    save_calls: AtomicUsize,
    failing_finds: AtomicUsize,
    failing_saves: AtomicUsize,
    find_delay: Mutex<Option<Duration>>,
    save_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockPlayerRepository {
    /// Store a row directly, bypassing the counters
    pub fn insert(&self, player: Player) {
        self.rows.lock().unwrap().insert(player.uuid(), player);
    }

    /// The row as last saved
    pub fn stored(&self, uuid: &Uuid) -> Option<Player> {
        self.rows.lock().unwrap().get(uuid).cloned()
    }

    pub fn find_calls(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    /// Make every lookup sleep before answering
    pub fn set_find_delay(&self, delay: Duration) {
        *self.find_delay.lock().unwrap() = Some(delay);
    }

    /// Fail the next `count` lookups
    pub fn fail_next_finds(&self, count: usize) {
        self.failing_finds.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` saves
    pub fn fail_next_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Hold every save after it records its row until a permit is added
    pub fn gate_saves(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.save_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn injected() -> AppError {
        AppError::QueryFailed(sqlx::Error::Protocol("injected failure".to_string()))
    }
}

#[async_trait]
impl Repository<Player> for MockPlayerRepository {
    async fn find_by_key(&self, key: &Uuid) -> Result<Lookup<Player>> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.find_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if Self::take_failure(&self.failing_finds) {
            return Err(Self::injected());
        }
        Ok(self.stored(key).into())
    }

    async fn save(&self, entity: &Player) -> Result<()> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_saves) {
            return Err(Self::injected());
        }
        self.insert(entity.clone());

        let gate = self.save_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        Ok(())
    }

    async fn delete(&self, key: &Uuid) -> Result<bool> {
        Ok(self.rows.lock().unwrap().remove(key).is_some())
    }
}
