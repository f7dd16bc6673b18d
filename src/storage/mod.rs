//! Backing-store access: the connection pool and schema management

pub mod db;
pub mod pool;


pub use db::{migrate, open_pool};
pub use pool::{ConnectionPool, MaintenanceReport, PoolStats, PooledConnection};
