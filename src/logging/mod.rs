//! Logging setup and operation timing
//!
//! Structured logging goes through `tracing`. This module installs the
//! subscriber for the binary and provides a small timer for the long-running
//! passes (flushes, drains, pool maintenance) so their duration shows up in
//! the log stream.

use std::time::{Duration, Instant};

use tracing::{Level, debug, info};
use tracing_subscriber::{EnvFilter, prelude::*};

/// Install the global tracing subscriber.
///
/// Honors `RUST_LOG`, defaulting to `info`. Safe to call more than once.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_line_number(true)
                .with_file(true),
        )
        .try_init();
}

/// Operation timer for logging the duration of a pass
pub struct OperationTimer {
    /// Name of the operation
    name: &'static str,
    /// Start time of the operation
    start_time: Instant,
    /// Level used for the start and end records
    level: Level,
}

impl OperationTimer {
    /// Start timing an operation, logged at debug level
    pub fn start(name: &'static str) -> Self {
        Self::start_at(name, Level::DEBUG)
    }

    /// Start timing an operation, logged at the given level
    pub fn start_at(name: &'static str, level: Level) -> Self {
        let timer = Self {
            name,
            start_time: Instant::now(),
            level,
        };
        timer.emit(format_args!("Starting operation: {}", name));
        timer
    }

    /// Elapsed time since the operation started
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Finish the operation, logging its duration and a summary
    pub fn finish(self, summary: impl std::fmt::Display) {
        let elapsed = self.elapsed();
        self.emit(format_args!(
            "Completed operation: {} in {:?} ({})",
            self.name, elapsed, summary
        ));
    }

    fn emit(&self, message: std::fmt::Arguments<'_>) {
        if self.level == Level::INFO {
            info!(operation = self.name, "{}", message);
        } else {
            debug!(operation = self.name, "{}", message);
        }
    }
}
