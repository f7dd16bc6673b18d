//! Player repository implementation
//!
//! This module translates player operations into parameterized statements
//! against a connection borrowed from the pool.

use async_trait::async_trait;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::entities::players::{Balance, Player, PlayerRow};
use crate::error::Result;
use crate::repositories::base::{Lookup, Repository};
use crate::storage::pool::ConnectionPool;

const SELECT_PLAYER: &str = r#"
    SELECT uuid, name, balance_cents, rank, prison_xp, prestige, last_seen
    FROM players
"#;

const UPSERT_PLAYER: &str = r#"
    INSERT INTO players (uuid, name, balance_cents, rank, prison_xp, prestige, last_seen)
    VALUES (?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(uuid) DO UPDATE SET
        name = excluded.name,
        balance_cents = excluded.balance_cents,
        rank = excluded.rank,
        prison_xp = excluded.prison_xp,
        prestige = excluded.prestige,
        last_seen = excluded.last_seen
"#;

/// Player repository implementation
#[derive(Debug, Clone)]
pub struct PlayerRepository {
    /// Connection pool
    pool: ConnectionPool,
}

impl PlayerRepository {
    /// Create a new player repository
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Get the connection pool
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Find a player by last known display name, ignoring case.
    ///
    /// Names are not unique over time; if two rows share a name the most
    /// recently seen one wins.
    #[instrument(skip(self))]
    pub async fn find_by_name(&self, name: &str) -> Result<Lookup<Player>> {
        debug!("Getting player by name: {}", name);
        let mut conn = self.pool.acquire().await?;

        let query = format!(
            "{SELECT_PLAYER} WHERE name = ? COLLATE NOCASE ORDER BY last_seen DESC LIMIT 1"
        );
        let row = sqlx::query_as::<_, PlayerRow>(&query)
            .bind(name)
            .fetch_optional(&mut *conn)
            .await;
        let row = row.map_err(|e| conn.observe(e))?;

        Ok(row.map(Player::try_from).transpose()?.into())
    }

    /// Overwrite a stored balance directly, bypassing any cached copy.
    ///
    /// Administrative path only: a player loaded in the cache will overwrite
    /// this on its next flush.
    #[instrument(skip(self))]
    pub async fn update_balance(&self, uuid: &Uuid, balance: Balance) -> Result<bool> {
        debug!("Updating player balance: uuid={}, balance={}", uuid, balance);
        let mut conn = self.pool.acquire().await?;

        let result = sqlx::query("UPDATE players SET balance_cents = ? WHERE uuid = ?")
            .bind(balance.cents())
            .bind(uuid.hyphenated().to_string())
            .execute(&mut *conn)
            .await;
        let result = result.map_err(|e| conn.observe(e))?;

        Ok(result.rows_affected() > 0)
    }

    /// Count stored players
    #[instrument(skip(self))]
    pub async fn count(&self) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM players")
            .fetch_one(&mut *conn)
            .await;
        let count: i64 = count.map_err(|e| conn.observe(e))?;
        Ok(count)
    }
}

#[async_trait]
impl Repository<Player> for PlayerRepository {
    #[instrument(skip(self))]
    async fn find_by_key(&self, key: &Uuid) -> Result<Lookup<Player>> {
        debug!("Getting player by uuid: {}", key);
        let mut conn = self.pool.acquire().await?;

        let query = format!("{SELECT_PLAYER} WHERE uuid = ?");
        let row = sqlx::query_as::<_, PlayerRow>(&query)
            .bind(key.hyphenated().to_string())
            .fetch_optional(&mut *conn)
            .await;
        let row = row.map_err(|e| conn.observe(e))?;

        Ok(row.map(Player::try_from).transpose()?.into())
    }

    #[instrument(skip(self, entity), fields(uuid = %entity.uuid()))]
    async fn save(&self, entity: &Player) -> Result<()> {
        debug!("Saving player: {}", entity.name());
        let mut conn = self.pool.acquire().await?;

        let result = sqlx::query(UPSERT_PLAYER)
            .bind(entity.uuid().hyphenated().to_string())
            .bind(entity.name())
            .bind(entity.balance.cents())
            .bind(entity.rank())
            .bind(entity.prison_xp)
            .bind(i64::from(entity.prestige))
            .bind(entity.last_seen)
            .execute(&mut *conn)
            .await;

        result.map_err(|e| conn.observe(e))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &Uuid) -> Result<bool> {
        debug!("Deleting player: {}", key);
        let mut conn = self.pool.acquire().await?;

        let result = sqlx::query("DELETE FROM players WHERE uuid = ?")
            .bind(key.hyphenated().to_string())
            .execute(&mut *conn)
            .await;
        let result = result.map_err(|e| conn.observe(e))?;

        Ok(result.rows_affected() > 0)
    }
}
