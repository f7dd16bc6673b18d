//! Repository pattern implementation for data access
//!
//! Each entity kind has a repository that owns its SQL. In front of the
//! repository sits an [`EntityCache`] holding the live instances, and a
//! [`Flusher`] that writes dirty instances back on a schedule.

pub mod base;
pub mod cache;
pub mod flusher;
pub mod player_repository;

#[cfg(test)]
pub mod tests;

// Re-export for easier access
pub use base::{CacheKey, Entity, Lookup, Repository};
pub use cache::{CacheStats, DirtyEntry, EntityCache, EvictOutcome, PlayerCache, Shared};
pub use flusher::{FlushReport, Flusher, FlusherHandle};
pub use player_repository::PlayerRepository;
