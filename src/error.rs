use std::{fmt::Display, sync::Arc, time::Duration};

use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Error severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorSeverity {
    /// The process cannot continue safely
    Fatal,
    /// Unsaved data may be lost
    Critical,
    /// An operation failed but can be retried
    #[default]
    Error,
    /// Caller mistakes and business-level refusals
    Warning,
}

/// Error category for taxonomic classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorCategory {
    /// Connection pool capacity and connection lifecycle
    Pool,
    /// Query execution against the backing store
    Database,
    /// Deferred writes from the flusher
    Persistence,
    /// Cache-level outcomes surfaced to interactive callers
    Cache,
    /// Errors related to configuration
    Configuration,
    /// Errors related to invalid input
    Validation,
    /// Errors that don't fit into other categories
    #[default]
    Other,
}

/// Standardized error type for the player store
#[derive(Debug, Error)]
pub enum AppError {
    // Pool-level errors
    #[error("Connection pool exhausted: no connection became free within {waited:?}")]
    PoolExhausted { waited: Duration },
    #[error("Backing store unavailable: {0}")]
    ConnectionUnavailable(#[source] sqlx::Error),

    // Query-level errors
    #[error("Query failed: {0}")]
    QueryFailed(#[source] sqlx::Error),
    #[error("Stored row could not be decoded: {0}")]
    InvalidRow(String),
    #[error("Schema migration failed: {0}")]
    MigrationFailed(#[from] MigrateError),

    // Cache-level errors
    #[error("Failed to persist {key}: {source}")]
    PersistFailed {
        key: String,
        #[source]
        source: Box<AppError>,
    },
    #[error("Entity {key} is not available: {source}")]
    Unavailable {
        key: String,
        #[source]
        source: Arc<AppError>,
    },
    #[error("Timed out after {waited:?} waiting for {key} to load")]
    LoadTimeout { key: String, waited: Duration },
    #[error("Load of {0} ended without a result")]
    LoadInterrupted(String),

    // Application-level errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        if is_connection_error(&err) {
            Self::ConnectionUnavailable(err)
        } else {
            Self::QueryFailed(err)
        }
    }
}

/// Whether a sqlx error means the connection itself can no longer be trusted
pub(crate) fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut
    )
}

impl AppError {
    /// Create a new validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a new configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Wrap a failed save of the entity with the given key
    pub fn persist_failed(key: impl Display, source: AppError) -> Self {
        Self::PersistFailed {
            key: key.to_string(),
            source: Box::new(source),
        }
    }

    /// Wrap a failed load so it can be handed to every waiter on the key
    pub fn unavailable(key: impl Display, source: Arc<AppError>) -> Self {
        Self::Unavailable {
            key: key.to_string(),
            source,
        }
    }

    /// The innermost error, looking through `Unavailable` and `PersistFailed`
    pub fn root_cause(&self) -> &AppError {
        match self {
            Self::Unavailable { source, .. } => source.root_cause(),
            Self::PersistFailed { source, .. } => source.root_cause(),
            _ => self,
        }
    }

    /// Get the error category for this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::PoolExhausted { .. } | Self::ConnectionUnavailable(_) => ErrorCategory::Pool,
            Self::QueryFailed(_) | Self::InvalidRow(_) | Self::MigrationFailed(_) => ErrorCategory::Database,
            Self::PersistFailed { .. } => ErrorCategory::Persistence,
            Self::Unavailable { .. } | Self::LoadTimeout { .. } | Self::LoadInterrupted(_) => {
                ErrorCategory::Cache
            }
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Validation(_) => ErrorCategory::Validation,
        }
    }

    /// Get the error severity for this error
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::MigrationFailed(_) | Self::Configuration(_) => ErrorSeverity::Fatal,
            Self::PersistFailed { .. } => ErrorSeverity::Critical,
            Self::Validation(_) => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }

    /// Check if this error is retriable
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::PoolExhausted { .. } | Self::ConnectionUnavailable(_) | Self::QueryFailed(_) => true,
            Self::PersistFailed { .. } | Self::LoadTimeout { .. } | Self::LoadInterrupted(_) => true,
            Self::Unavailable { source, .. } => source.is_retriable(),
            _ => false,
        }
    }

    /// Log this error with structured logging
    pub fn log(&self) {
        tracing::error!(
            severity = ?self.severity(),
            category = ?self.category(),
            retriable = %self.is_retriable(),
            "{}", self
        );
    }
}

pub type Result<T, E = AppError> = core::result::Result<T, E>;
