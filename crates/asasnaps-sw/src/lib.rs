//! # AsaSnaps Offline Worker
//!
//! Offline cache and network-fallback service worker for the AsaSnaps site.
//!
//! ## Features
//!
//! - **Precache**: the app shell is fetched and stored atomically at install
//! - **Generations**: stale caches are deleted when a new version activates
//! - **Network-first fetch**: live responses are cached; on failure the last
//!   cached copy, then the offline document, is served
//! - **Push**: notifications with site defaults, click routing to open pages
//! - **Background sync**: contact-form submissions queued while offline
//!
//! ## Architecture
//!
//! ```text
//! Registration (scope)
//!     ├── waiting (InstalledWorker)
//!     └── active (ActiveWorker)
//!             ├── fetch ──► RequestFilter ──► Fetcher ──► CacheStore
//!             ├── push ──► NotificationHost
//!             ├── notificationclick ──► ClientHost
//!             └── sync ──► DeferredTask (FormDataSync ──► FormOutbox)
//!
//! CacheStore (caches)
//!     └── "asasnaps-v1"
//!             └── CacheKey → Response
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use asasnaps_net::{HttpFetcher, LoaderConfig, Request};
//! use asasnaps_sw::{
//!     ClientList, MemoryCacheStorage, NotificationCenter, NotificationPermission, Registration,
//!     ServiceWorker, WorkerConfig, WorkerHost,
//! };
//! use url::Url;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let scope = Url::parse("https://asasnaps.example/")?;
//! let host = WorkerHost::new(
//!     Arc::new(MemoryCacheStorage::new()),
//!     Arc::new(HttpFetcher::new(LoaderConfig::new(scope.clone()))?),
//!     Arc::new(ClientList::new()),
//!     Arc::new(NotificationCenter::new(NotificationPermission::Default)),
//! );
//!
//! let (registration, _events) = Registration::new(scope.clone());
//! registration
//!     .register(ServiceWorker::new(WorkerConfig::new(scope.clone()), host)?)
//!     .await?;
//!
//! let outcome = registration
//!     .dispatch_fetch(Request::navigate(scope.join("/gallery")?))
//!     .await?;
//! println!("served from {}", outcome.source());
//! # Ok(())
//! # }
//! ```

pub mod activate;
pub mod cache;
pub mod clients;
pub mod config;
pub mod error;
pub mod event;
pub mod fetch;
pub mod install;
pub mod lifecycle;
pub mod notify;
pub mod registration;
pub mod sync;
pub mod worker;

pub use activate::{ActivationFailure, ActivationReport};
pub use cache::{CacheEntry, CacheHandle, CacheKey, CacheStore, MemoryCacheStorage};
pub use clients::{Client, ClientHost, ClientList, ClientType};
pub use config::{ConfigError, NotificationConfig, SyncConfig, WorkerConfig};
pub use error::ServiceWorkerError;
pub use event::{ExtendableEvent, Settled};
pub use fetch::{BypassReason, FetchOutcome, FilterDecision, RequestFilter};
pub use install::Precached;
pub use lifecycle::{LifecycleEvent, ServiceWorkerId, WorkerState};
pub use notify::{
    ClickOutcome, Notification, NotificationCenter, NotificationData, NotificationHost,
    NotificationId, NotificationPermission, PushOutcome, PushPayload,
};
pub use registration::{Registration, RegistrationEvent};
pub use sync::{
    ContactSubmission, DeferredTask, FormDataSync, FormOutbox, SubmissionError, SyncManager,
    SyncOutcome,
};
pub use worker::{ActiveWorker, InstalledWorker, ServiceWorker, WorkerHost};
