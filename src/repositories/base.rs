//! Base repository trait and shared types
//!
//! This module provides the traits that tie an entity kind to its storage:
//! [`Entity`] names the stable key of a record, [`Repository`] is the
//! per-kind persistence contract the cache and flusher drive, and
//! [`Lookup`] is the explicit found/not-found result every layer passes
//! along instead of a nullable value.

use std::{fmt::Debug, hash::Hash};

use async_trait::async_trait;

use crate::error::Result;

/// Cache key trait for entity identities
pub trait CacheKey: Hash + Eq + Clone + Debug + std::fmt::Display + Send + Sync + 'static {}

impl CacheKey for uuid::Uuid {}

/// A persisted record with an immutable identity key
pub trait Entity: Clone + Debug + Send + Sync + 'static {
    type Key: CacheKey;

    /// Short name of the entity kind, used in logs and errors
    const KIND: &'static str;

    fn key(&self) -> Self::Key;
}

/// Result of looking a record up by key: absence is an outcome, not an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }

    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::NotFound => None,
        }
    }

    pub fn as_ref(&self) -> Lookup<&T> {
        match self {
            Lookup::Found(value) => Lookup::Found(value),
            Lookup::NotFound => Lookup::NotFound,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Found(value) => Lookup::Found(f(value)),
            Lookup::NotFound => Lookup::NotFound,
        }
    }
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(value) => Lookup::Found(value),
            None => Lookup::NotFound,
        }
    }
}

/// Persistence contract for one entity kind.
///
/// Every operation borrows exactly one pooled connection for its duration
/// and gives it back on every exit path. Implementations must bind all
/// caller-supplied values as parameters.
#[async_trait]
pub trait Repository<T>: Send + Sync + 'static
where
    T: Entity,
{
    /// Get the entity by key; a missing row is `Lookup::NotFound`
    async fn find_by_key(&self, key: &T::Key) -> Result<Lookup<T>>;

    /// Insert or update the entity, keyed by its identity
    async fn save(&self, entity: &T) -> Result<()>;

    /// Delete an entity by key, reporting whether a row was removed
    async fn delete(&self, key: &T::Key) -> Result<bool>;

    /// Check if an entity exists by key
    async fn exists(&self, key: &T::Key) -> Result<bool> {
        Ok(self.find_by_key(key).await?.is_found())
    }

    /// Save several entities.
    ///
    /// The default implementation saves them one by one and stops at the
    /// first failure.
    async fn save_all(&self, entities: &[T]) -> Result<()> {
        for entity in entities {
            self.save(entity).await?;
        }
        Ok(())
    }
}
