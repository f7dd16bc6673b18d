//! Tests for the Flusher
//!
//! This module covers flush passes against both the mock repository and the
//! SQLite-backed player repository.

use std::{sync::Arc, time::Duration};

use uuid::Uuid;

use crate::config::{CacheConfig, FlushConfig};
use crate::entities::{Balance, Player};
use crate::repositories::tests::{assertions, generators, mock_cache, setup_test_db};
use crate::repositories::{EntityCache, Flusher, Lookup, PlayerRepository};

fn fast_flush() -> FlushConfig {
    FlushConfig {
        interval: Duration::from_millis(50),
        keep_alive_interval: Duration::from_millis(50),
        concurrency: 2,
    }
}

#[tokio::test]
async fn test_created_player_is_persisted_by_flush() -> crate::error::Result<()> {
    // Setup
    let pool = setup_test_db().await;
    let repo = Arc::new(PlayerRepository::new(pool.clone()));
    let cache = EntityCache::new(Arc::clone(&repo), CacheConfig::default());
    let flusher = Flusher::new(cache.clone(), pool, FlushConfig::default());
    let k1 = Uuid::new_v4();

    assert!(!cache.get(&k1).await?.is_found());
    let created = cache.get_or_create(&k1, || Player::new(k1, "K1")).await?;
    assert_eq!(created.read().await.balance, Balance::ZERO);
    assert!(cache.is_dirty(&k1));

    // Execute
    let report = flusher.flush_once().await;

    // Verify
    assert_eq!(report.saved, 1);
    assert!(report.is_complete());
    assert!(!cache.is_dirty(&k1));
    assertions::assert_stored_balance(&repo, &k1, Balance::ZERO).await?;

    Ok(())
}

#[tokio::test]
async fn test_clean_entries_are_not_saved() -> crate::error::Result<()> {
    // Setup
    let pool = setup_test_db().await;
    let (cache, repo) = mock_cache(CacheConfig::default());
    let uuid = Uuid::new_v4();
    repo.insert(generators::player(uuid));
    cache.get(&uuid).await?;
    let flusher = Flusher::new(cache, pool, FlushConfig::default());

    // Execute
    let report = flusher.flush_once().await;

    // Verify
    assert_eq!(report.attempted, 0);
    assert_eq!(repo.save_calls(), 0);

    Ok(())
}

#[tokio::test]
async fn test_failed_save_stays_dirty_until_next_pass() -> crate::error::Result<()> {
    // Setup
    let pool = setup_test_db().await;
    let (cache, repo) = mock_cache(CacheConfig::default());
    let uuid = Uuid::new_v4();
    cache.put(generators::player(uuid));
    repo.fail_next_saves(1);
    let flusher = Flusher::new(cache.clone(), pool, FlushConfig::default());

    // Execute
    let first = flusher.flush_once().await;
    let second = flusher.flush_once().await;

    // Verify
    assert_eq!(first.failed, 1);
    assert_eq!(first.failed_keys, vec![uuid.to_string()]);
    assert_eq!(second.saved, 1);
    assert!(!cache.is_dirty(&uuid));
    assert!(repo.stored(&uuid).is_some());

    Ok(())
}

#[tokio::test]
async fn test_mutation_during_save_is_persisted_next_pass() -> crate::error::Result<()> {
    // Setup
    let pool = setup_test_db().await;
    let (cache, repo) = mock_cache(CacheConfig::default());
    let uuid = Uuid::new_v4();
    cache.put(generators::player(uuid));
    let gate = repo.gate_saves();
    let flusher = Arc::new(Flusher::new(cache.clone(), pool, FlushConfig::default()));

    let pass = {
        let flusher = Arc::clone(&flusher);
        tokio::spawn(async move { flusher.flush_once().await })
    };
    while repo.save_calls() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Execute
    let deposited = cache.update(&uuid, |p| p.deposit(Balance::from_whole(1))).await?;
    assert!(matches!(deposited, Lookup::Found(Ok(_))));
    gate.add_permits(1);
    let report = pass.await.expect("flush task panicked");

    // Verify
    assert_eq!(report.superseded, 1);
    assert!(cache.is_dirty(&uuid));
    let stored = repo.stored(&uuid).expect("snapshot saved");
    assert_eq!(stored.balance, Balance::from_cents(12_345));

    gate.add_permits(1);
    let next = flusher.flush_once().await;
    assert_eq!(next.saved, 1);
    assert!(!cache.is_dirty(&uuid));
    let stored = repo.stored(&uuid).expect("latest saved");
    assert_eq!(stored.balance, Balance::from_cents(12_445));

    Ok(())
}

#[tokio::test]
async fn test_drain_attempts_every_dirty_entry() -> crate::error::Result<()> {
    // Setup
    let pool = setup_test_db().await;
    let (cache, repo) = mock_cache(CacheConfig::default());
    for player in generators::players(3) {
        cache.put(player);
    }
    repo.fail_next_saves(1);
    let flusher = Flusher::new(cache.clone(), pool, FlushConfig::default());

    // Execute
    let report = flusher.drain().await;

    // Verify
    assert_eq!(report.attempted, 3);
    assert_eq!(report.saved, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failed_keys.len(), 1);
    assert!(!report.is_complete());
    assert_eq!(cache.stats().dirty, 1);

    Ok(())
}

#[tokio::test]
async fn test_tick_evicts_expired_sessions() -> crate::error::Result<()> {
    // Setup
    let pool = setup_test_db().await;
    let config = CacheConfig {
        eviction_grace: Duration::ZERO,
        ..CacheConfig::default()
    };
    let (cache, repo) = mock_cache(config);
    let uuid = Uuid::new_v4();
    repo.insert(generators::player(uuid));
    let player = cache.get(&uuid).await?.found().expect("loaded");
    assert!(cache.session_ended(&uuid, &player));
    let flusher = Flusher::new(cache.clone(), pool, FlushConfig::default());

    // Execute
    flusher.tick().await;

    // Verify
    assert!(!cache.contains(&uuid));

    Ok(())
}

#[tokio::test]
async fn test_background_flusher_persists_and_drains_on_shutdown() -> crate::error::Result<()> {
    // Setup
    let pool = setup_test_db().await;
    let repo = Arc::new(PlayerRepository::new(pool.clone()));
    let cache = EntityCache::new(Arc::clone(&repo), CacheConfig::default());
    let uuid = Uuid::new_v4();
    cache.put(generators::player(uuid));
    let handle = Flusher::new(cache.clone(), pool.clone(), fast_flush()).start();

    // Execute
    tokio::time::sleep(Duration::from_millis(200)).await;
    assertions::assert_player_stored(&repo, &uuid).await?;

    let deposited = cache.update(&uuid, |p| p.deposit(Balance::from_whole(10))).await?;
    assert!(matches!(deposited, Lookup::Found(Ok(_))));
    let report = handle.shutdown().await;

    // Verify
    assert!(report.is_complete());
    assert!(!cache.is_dirty(&uuid));
    assertions::assert_stored_balance(&repo, &uuid, Balance::from_cents(13_345)).await?;
    assert!(!pool.is_closed());

    Ok(())
}
