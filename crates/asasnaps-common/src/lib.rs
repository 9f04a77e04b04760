//! # AsaSnaps Common
//!
//! Shared pieces used by every crate of the AsaSnaps offline worker.
//!
//! ## Features
//!
//! - Logging configuration and setup
//! - Error categorisation for structured log fields
//! - Wall-clock helpers for cache metadata

use std::time::{SystemTime, UNIX_EPOCH};

pub mod logging;

pub use logging::{init_logging, try_init_logging, LogConfig, LogFormat, LoggingError};

/// Errors that can report a stable, low-cardinality category.
///
/// The category is emitted as the `category` field on warning and error
/// events so that log pipelines can group failures without parsing messages.
pub trait ErrorCategory {
    /// Short machine-readable category, e.g. `"network"` or `"storage"`.
    fn category(&self) -> &'static str;

    /// Whether the same operation may succeed if attempted again later.
    fn is_transient(&self) -> bool {
        false
    }
}

/// Milliseconds since the Unix epoch, or zero if the clock is before it.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
