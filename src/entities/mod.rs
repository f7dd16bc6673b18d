//! Persisted entity types

pub mod players;

pub use players::{Balance, Player, validate_name};
