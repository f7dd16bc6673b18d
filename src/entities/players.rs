use std::fmt;

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::repositories::base::Entity;

/// Longest display name the game accepts
pub const MAX_NAME_LEN: usize = 16;
/// Longest rank label the schema stores
pub const MAX_RANK_LEN: usize = 16;
/// Rank given to players on first join
pub const STARTING_RANK: &str = "A";

/// Fixed-point currency amount in hundredths
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Balance(i64);

impl Balance {
    pub const ZERO: Balance = Balance(0);

    /// Balance from an amount in hundredths
    pub const fn from_cents(cents: i64) -> Self {
        Self(cents)
    }

    /// Balance from a whole-unit amount, or `None` if it does not fit
    pub const fn checked_from_whole(units: i64) -> Option<Self> {
        match units.checked_mul(100) {
            Some(cents) => Some(Self(cents)),
            None => None,
        }
    }

    /// Balance from a whole-unit amount.
    ///
    /// # Panics
    ///
    /// Panics if `units` is outside `i64::MIN / 100..=i64::MAX / 100`; use
    /// [`Balance::checked_from_whole`] for untrusted amounts.
    pub const fn from_whole(units: i64) -> Self {
        match Self::checked_from_whole(units) {
            Some(balance) => balance,
            None => panic!("whole amount out of range for Balance"),
        }
    }

    pub const fn cents(self) -> i64 {
        self.0
    }

    pub fn checked_add(self, other: Balance) -> Option<Balance> {
        self.0.checked_add(other.0).map(Balance)
    }

    pub fn checked_sub(self, other: Balance) -> Option<Balance> {
        self.0.checked_sub(other.0).map(Balance)
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

/// Player record: one row per player identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Player {
    uuid: Uuid,
    name: String,
    pub balance: Balance,
    rank: String,
    pub prison_xp: i64,
    pub prestige: i32,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Player {
    /// A never-before-seen player with starting values
    pub fn new(uuid: Uuid, name: &str) -> Result<Self> {
        validate_name(name)?;
        Ok(Self {
            uuid,
            name: name.to_string(),
            balance: Balance::ZERO,
            rank: STARTING_RANK.to_string(),
            prison_xp: 0,
            prestige: 0,
            last_seen: None,
        })
    }

    /// Stable identity; never changes once assigned
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rank(&self) -> &str {
        &self.rank
    }

    /// Change the last known display name
    pub fn rename(&mut self, name: &str) -> Result<bool> {
        validate_name(name)?;
        if self.name == name {
            return Ok(false);
        }
        self.name = name.to_string();
        Ok(true)
    }

    pub fn set_rank(&mut self, rank: &str) -> Result<()> {
        validate_rank(rank)?;
        self.rank = rank.to_string();
        Ok(())
    }

    pub fn deposit(&mut self, amount: Balance) -> Result<Balance> {
        if amount.cents() < 0 {
            return Err(AppError::validation("deposit amount cannot be negative"));
        }
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or_else(|| AppError::validation("balance overflow"))?;
        Ok(self.balance)
    }

    /// Take money out; refuses to overdraw and returns whether it happened
    pub fn withdraw(&mut self, amount: Balance) -> bool {
        if amount.cents() < 0 || amount > self.balance {
            return false;
        }
        match self.balance.checked_sub(amount) {
            Some(rest) => {
                self.balance = rest;
                true
            }
            None => false,
        }
    }

    pub fn add_prison_xp(&mut self, xp: i64) -> i64 {
        self.prison_xp = self.prison_xp.saturating_add(xp).max(0);
        self.prison_xp
    }

    /// Reset rank and balance in exchange for a prestige level
    pub fn prestige_up(&mut self) -> i32 {
        self.prestige = self.prestige.saturating_add(1);
        self.rank = STARTING_RANK.to_string();
        self.balance = Balance::ZERO;
        self.prestige
    }

    /// Record that the player was just seen online
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_seen = Some(at);
    }
}

impl Entity for Player {
    type Key = Uuid;
    const KIND: &'static str = "player";

    fn key(&self) -> Uuid {
        self.uuid
    }
}

/// Row shape of the `players` table
#[derive(Debug, FromRow)]
pub(crate) struct PlayerRow {
    pub uuid: String,
    pub name: String,
    pub balance_cents: i64,
    pub rank: String,
    pub prison_xp: i64,
    pub prestige: i64,
    pub last_seen: Option<DateTime<Utc>>,
}

impl TryFrom<PlayerRow> for Player {
    type Error = AppError;

    fn try_from(row: PlayerRow) -> Result<Self> {
        let uuid = Uuid::parse_str(&row.uuid)
            .map_err(|e| AppError::InvalidRow(format!("players.uuid {:?}: {}", row.uuid, e)))?;
        let prestige = i32::try_from(row.prestige)
            .map_err(|_| AppError::InvalidRow(format!("players.prestige out of range for {}", uuid)))?;
        Ok(Self {
            uuid,
            name: row.name,
            balance: Balance::from_cents(row.balance_cents),
            rank: row.rank,
            prison_xp: row.prison_xp,
            prestige,
            last_seen: row.last_seen,
        })
    }
}

/// Check a display name fits the game's limits
pub fn validate_name(name: &str) -> Result<()> {
    let len = name.chars().count();
    if len == 0 || len > MAX_NAME_LEN {
        return Err(AppError::validation(format!(
            "player name must be 1..={} characters, got {:?}",
            MAX_NAME_LEN, name
        )));
    }
    Ok(())
}

fn validate_rank(rank: &str) -> Result<()> {
    let len = rank.chars().count();
    if len == 0 || len > MAX_RANK_LEN {
        return Err(AppError::validation(format!(
            "rank must be 1..={} characters, got {:?}",
            MAX_RANK_LEN, rank
        )));
    }
    Ok(())
}
