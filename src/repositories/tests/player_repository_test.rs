//! Tests for the PlayerRepository
//!
//! This module contains tests for the PlayerRepository implementation.

use uuid::Uuid;

use crate::entities::Balance;
use crate::error::AppError;
use crate::repositories::tests::{assertions, generators, setup_test_db};
use crate::repositories::{Lookup, PlayerRepository, Repository};

#[tokio::test]
async fn test_find_missing_player_is_not_found() -> crate::error::Result<()> {
    // Setup
    let pool = setup_test_db().await;
    let repo = PlayerRepository::new(pool.clone());

    // Execute
    let lookup = repo.find_by_key(&Uuid::new_v4()).await?;

    // Verify
    assert_eq!(lookup, Lookup::NotFound);
    assert_eq!(pool.stats().in_use, 0);

    Ok(())
}

#[tokio::test]
async fn test_save_and_find_player() -> crate::error::Result<()> {
    // Setup
    let pool = setup_test_db().await;
    let repo = PlayerRepository::new(pool);
    let uuid = Uuid::new_v4();
    let player = generators::player(uuid);

    // Execute
    repo.save(&player).await?;

    // Verify
    let stored = assertions::assert_player_stored(&repo, &uuid).await?;
    assert_eq!(stored, player);
    assert!(repo.exists(&uuid).await?);

    Ok(())
}

#[tokio::test]
async fn test_save_is_idempotent_upsert() -> crate::error::Result<()> {
    // Setup
    let pool = setup_test_db().await;
    let repo = PlayerRepository::new(pool);
    let uuid = Uuid::new_v4();
    let mut player = generators::player(uuid);

    // Execute
    repo.save(&player).await?;
    repo.save(&player).await?;

    // Verify
    assertions::assert_player_count(&repo, 1).await?;
    assert_eq!(assertions::assert_player_stored(&repo, &uuid).await?, player);

    // A changed entity updates the same row
    player.deposit(Balance::from_cents(55))?;
    player.set_rank("D")?;
    repo.save(&player).await?;

    assertions::assert_player_count(&repo, 1).await?;
    let stored = assertions::assert_player_stored(&repo, &uuid).await?;
    assert_eq!(stored.balance, Balance::from_cents(12_400));
    assert_eq!(stored.rank(), "D");

    Ok(())
}

#[tokio::test]
async fn test_delete_reports_removal() -> crate::error::Result<()> {
    // Setup
    let pool = setup_test_db().await;
    let repo = PlayerRepository::new(pool);
    let uuid = Uuid::new_v4();
    repo.save(&generators::player(uuid)).await?;

    // Execute
    let first = repo.delete(&uuid).await?;
    let second = repo.delete(&uuid).await?;

    // Verify
    assert!(first);
    assert!(!second);
    assertions::assert_player_not_stored(&repo, &uuid).await?;

    Ok(())
}

#[tokio::test]
async fn test_hostile_names_are_bound_as_values() -> crate::error::Result<()> {
    // Setup
    let pool = setup_test_db().await;
    let repo = PlayerRepository::new(pool);
    let hostile = generators::hostile_player(Uuid::new_v4());
    repo.save(&hostile).await?;
    repo.save_all(&generators::players(3)).await?;

    // Execute
    let exact = repo.find_by_name(hostile.name()).await?;
    let injected = repo.find_by_name("nobody' OR '1'='1").await?;

    // Verify
    assert_eq!(exact.found().map(|p| p.uuid()), Some(hostile.uuid()));
    assert_eq!(injected, Lookup::NotFound);
    assertions::assert_player_count(&repo, 4).await?;

    Ok(())
}

#[tokio::test]
async fn test_find_by_name_ignores_case() -> crate::error::Result<()> {
    // Setup
    let pool = setup_test_db().await;
    let repo = PlayerRepository::new(pool);
    let player = generators::player(Uuid::new_v4());
    repo.save(&player).await?;

    // Execute
    let lookup = repo.find_by_name(&player.name().to_uppercase()).await?;

    // Verify
    assert_eq!(lookup.found().map(|p| p.uuid()), Some(player.uuid()));

    Ok(())
}

#[tokio::test]
async fn test_update_balance() -> crate::error::Result<()> {
    // Setup
    let pool = setup_test_db().await;
    let repo = PlayerRepository::new(pool);
    let uuid = Uuid::new_v4();
    repo.save(&generators::player(uuid)).await?;

    // Execute
    let updated = repo.update_balance(&uuid, Balance::from_whole(7)).await?;
    let missing = repo.update_balance(&Uuid::new_v4(), Balance::from_whole(7)).await?;

    // Verify
    assert!(updated);
    assert!(!missing);
    assertions::assert_stored_balance(&repo, &uuid, Balance::from_cents(700)).await?;

    Ok(())
}

#[tokio::test]
async fn test_operations_return_their_connection() -> crate::error::Result<()> {
    // Setup
    let pool = setup_test_db().await;
    let repo = PlayerRepository::new(pool.clone());
    let uuid = Uuid::new_v4();

    // Execute
    repo.save(&generators::player(uuid)).await?;
    repo.find_by_key(&uuid).await?;
    repo.find_by_name("nobody").await?;
    repo.delete(&uuid).await?;

    // Verify
    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert!(stats.idle >= 1);

    Ok(())
}

#[tokio::test]
async fn test_failed_queries_return_their_connection() -> crate::error::Result<()> {
    // Setup
    let pool = setup_test_db().await;
    let repo = PlayerRepository::new(pool.clone());
    let uuid = Uuid::new_v4();
    {
        let mut conn = pool.acquire().await?;
        sqlx::query("DROP TABLE players").execute(&mut *conn).await?;
    }

    // Execute
    let found = repo.find_by_key(&uuid).await;
    let saved = repo.save(&generators::player(uuid)).await;
    let deleted = repo.delete(&uuid).await;

    // Verify
    assert!(matches!(found, Err(AppError::QueryFailed(_))));
    assert!(matches!(saved, Err(AppError::QueryFailed(_))));
    assert!(matches!(deleted, Err(AppError::QueryFailed(_))));
    let stats = pool.stats();
    assert_eq!(stats.in_use, 0);
    assert!(stats.idle >= 1, "query failures must not discard the connection");

    Ok(())
}
