//! Session-facing entry points for the host server
//!
//! The host calls [`PlayerSessions::join`] when a player connects and
//! [`PlayerSessions::leave`] when they disconnect. Everything else a command
//! or game event needs goes through `lookup` and `modify`, which always hand
//! out the one shared instance held by the cache.

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::entities::{Player, validate_name};
use crate::error::Result;
use crate::repositories::{Lookup, PlayerCache, Repository, Shared};

/// Player lifecycle operations over the shared cache
#[derive(Debug, Clone)]
pub struct PlayerSessions {
    cache: PlayerCache,
}

impl PlayerSessions {
    pub fn new(cache: PlayerCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &PlayerCache {
        &self.cache
    }

    /// Load or create the player, refresh their name and mark them online.
    ///
    /// The player is pinned online and marked dirty while their write lock is
    /// held. If grace-period eviction unloaded them after the lookup, the
    /// lookup is repeated so the returned instance is always the cached one.
    #[instrument(skip(self))]
    pub async fn join(&self, uuid: Uuid, name: &str) -> Result<Shared<Player>> {
        validate_name(name)?;

        loop {
            let player = self.cache.get_or_create(&uuid, || Player::new(uuid, name)).await?;

            let mut guard = player.write().await;
            if !self.cache.session_started(&uuid, &player) || !self.cache.mark_instance_dirty(&uuid, &player) {
                debug!("Player {} was unloaded while joining, retrying", uuid);
                continue;
            }
            if guard.rename(name)? {
                info!("Player {} is now known as {}", uuid, name);
            }
            guard.touch(Utc::now());
            drop(guard);

            info!("Player {} ({}) joined", name, uuid);
            return Ok(player);
        }
    }

    /// Run `join` on a background task so the caller's dispatch path never
    /// waits on the store
    pub fn join_in_background(&self, uuid: Uuid, name: String) -> JoinHandle<Result<Shared<Player>>> {
        let sessions = self.clone();
        tokio::spawn(async move {
            let result = sessions.join(uuid, &name).await;
            if let Err(e) = &result {
                warn!("Could not load player {} ({}): {}", name, uuid, e);
            }
            result
        })
    }

    /// Stamp the player's last-seen time and start their eviction grace period.
    ///
    /// Returns false if the player was not loaded.
    #[instrument(skip(self))]
    pub async fn leave(&self, uuid: Uuid) -> bool {
        let Some(player) = self.cache.peek(&uuid) else {
            debug!("Player {} left without a loaded record", uuid);
            return false;
        };

        let mut guard = player.write().await;
        if !self.cache.mark_instance_dirty(&uuid, &player) {
            debug!("Player {} was unloaded before leaving", uuid);
            return false;
        }
        guard.touch(Utc::now());
        self.cache.session_ended(&uuid, &player);
        drop(guard);

        info!("Player {} left", uuid);
        true
    }

    /// The shared instance for `uuid`, loading it if needed
    pub async fn lookup(&self, uuid: Uuid) -> Result<Lookup<Shared<Player>>> {
        self.cache.get(&uuid).await
    }

    /// Find a player by display name: loaded players first, then the store
    #[instrument(skip(self))]
    pub async fn lookup_by_name(&self, name: &str) -> Result<Lookup<Shared<Player>>> {
        for (_, player) in self.cache.loaded() {
            if player.read().await.name().eq_ignore_ascii_case(name) {
                return Ok(Lookup::Found(player));
            }
        }

        match self.cache.repository().find_by_name(name).await? {
            Lookup::Found(stored) => self.cache.get(&stored.uuid()).await,
            Lookup::NotFound => Ok(Lookup::NotFound),
        }
    }

    /// Mutate the player under their write lock and schedule a save
    pub async fn modify<U>(&self, uuid: Uuid, f: impl FnOnce(&mut Player) -> U) -> Result<Lookup<U>> {
        self.cache.update(&uuid, f).await
    }

    /// Remove the player from memory and from the store
    #[instrument(skip(self))]
    pub async fn delete(&self, uuid: Uuid) -> Result<bool> {
        let was_cached = self.cache.forget(&uuid);
        let deleted = self.cache.repository().delete(&uuid).await?;
        info!("Deleted player {} (cached: {}, stored: {})", uuid, was_cached, deleted);
        Ok(deleted)
    }
}
