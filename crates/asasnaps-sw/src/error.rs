//! Error types for the offline worker.

use asasnaps_common::ErrorCategory;
use asasnaps_net::NetError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::lifecycle::{LifecycleEvent, WorkerState};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone)]
pub enum ServiceWorkerError {
    #[error("Install failed for {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid state: cannot {event} while {state}")]
    InvalidState {
        state: WorkerState,
        event: LifecycleEvent,
    },

    #[error("No cached response or offline fallback for {0}")]
    NoFallback(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Client error: {0}")]
    Client(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Task aborted: {0}")]
    TaskAborted(String),
}

impl ServiceWorkerError {
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::StorageUnavailable(msg.into())
    }

    pub fn client(msg: impl Into<String>) -> Self {
        Self::Client(msg.into())
    }
}

impl ErrorCategory for ServiceWorkerError {
    fn category(&self) -> &'static str {
        match self {
            ServiceWorkerError::InstallFailed { .. } => "install",
            ServiceWorkerError::StorageUnavailable(_) => "storage",
            ServiceWorkerError::Network(_) => "network",
            ServiceWorkerError::InvalidState { .. } => "state",
            ServiceWorkerError::NoFallback(_) => "no_fallback",
            ServiceWorkerError::NotFound(_) => "not_found",
            ServiceWorkerError::Config(_) => "config",
            ServiceWorkerError::Client(_) => "client",
            ServiceWorkerError::Notification(_) => "notification",
            ServiceWorkerError::TaskAborted(_) => "task",
        }
    }

    fn is_transient(&self) -> bool {
        matches!(
            self,
            ServiceWorkerError::InstallFailed { .. }
                | ServiceWorkerError::StorageUnavailable(_)
                | ServiceWorkerError::Network(_)
        )
    }
}

impl From<NetError> for ServiceWorkerError {
    fn from(err: NetError) -> Self {
        Self::Network(err.to_string())
    }
}

impl From<ConfigError> for ServiceWorkerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
