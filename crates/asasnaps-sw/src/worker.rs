//! Worker handles, one per lifecycle stage.
//!
//! ```text
//! ServiceWorker ──install()──► InstalledWorker ──activate()──► ActiveWorker
//!   (parsed)                     (waiting)                      (handles events)
//! ```
//!
//! Each stage consumes the previous handle, so only an [`ActiveWorker`] can
//! be asked to intercept a fetch. The shared [`WorkerState`] still follows
//! the checked transition table; it is what a retired worker consults to
//! stop intercepting.

use std::sync::Arc;

use asasnaps_common::ErrorCategory;
use asasnaps_net::{Fetcher, Request};
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::activate::{prune_generations, ActivationFailure, ActivationReport};
use crate::cache::CacheStore;
use crate::clients::ClientHost;
use crate::config::WorkerConfig;
use crate::error::ServiceWorkerError;
use crate::event::ExtendableEvent;
use crate::fetch::{BypassReason, FetchOutcome, Interceptor, RequestFilter};
use crate::install::{precache, Precached};
use crate::lifecycle::{LifecycleEvent, ServiceWorkerId, WorkerState};
use crate::notify::{
    route_click, ClickOutcome, Notification, NotificationHost, NotificationPermission,
    PushOutcome, PushPayload,
};
use crate::sync::{
    run_to_completion, ContactSubmission, DeferredTask, FormDataSync, FormOutbox,
    SubmissionError, SyncManager, SyncOutcome,
};

type Result<T> = std::result::Result<T, ServiceWorkerError>;

/// Host facilities a worker runs against.
#[derive(Clone)]
pub struct WorkerHost {
    pub caches: Arc<dyn CacheStore>,
    pub fetcher: Arc<dyn Fetcher>,
    pub clients: Arc<dyn ClientHost>,
    pub notifications: Arc<dyn NotificationHost>,
}

impl WorkerHost {
    pub fn new(
        caches: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetcher>,
        clients: Arc<dyn ClientHost>,
        notifications: Arc<dyn NotificationHost>,
    ) -> Self {
        Self {
            caches,
            fetcher,
            clients,
            notifications,
        }
    }
}

/// State shared by every stage of one worker.
struct WorkerContext {
    id: ServiceWorkerId,
    config: WorkerConfig,
    manifest: Vec<Url>,
    offline_url: Url,
    filter: RequestFilter,
    host: WorkerHost,
    tasks: HashMap<String, Arc<dyn DeferredTask>>,
    sync: Arc<SyncManager>,
    outbox: Arc<FormOutbox>,
    state: RwLock<WorkerState>,
}

impl WorkerContext {
    async fn advance(&self, event: LifecycleEvent) -> Result<WorkerState> {
        let mut state = self.state.write().await;
        let from = *state;
        let next = from.transition(event)?;
        debug!(worker = %self.id, %from, to = %next, "Worker state changed");
        *state = next;
        Ok(next)
    }

    async fn state(&self) -> WorkerState {
        *self.state.read().await
    }
}

/// A parsed worker that has not installed yet.
pub struct ServiceWorker {
    ctx: WorkerContext,
}

impl ServiceWorker {
    /// Validate `config` and prepare a worker. The contact-form sync task is
    /// registered under the configured tag.
    pub fn new(config: WorkerConfig, host: WorkerHost) -> Result<Self> {
        config.validate()?;
        let manifest = config.precache_urls()?;
        let offline_url = config.offline_document()?;
        let endpoint = config
            .sync
            .form_endpoint
            .as_deref()
            .map(|path| config.resolve(path))
            .transpose()?;

        let outbox = Arc::new(FormOutbox::new());
        let sync = Arc::new(SyncManager::new());
        let form_sync: Arc<dyn DeferredTask> = Arc::new(FormDataSync::new(
            config.sync.form_tag.clone(),
            Arc::clone(&outbox),
            Arc::clone(&sync),
            endpoint,
            Arc::clone(&host.fetcher),
        ));
        let mut tasks = HashMap::new();
        tasks.insert(form_sync.tag().to_string(), form_sync);

        Ok(Self {
            ctx: WorkerContext {
                id: ServiceWorkerId::new(),
                filter: RequestFilter::from_config(&config),
                config,
                manifest,
                offline_url,
                host,
                tasks,
                sync,
                outbox,
                state: RwLock::new(WorkerState::Parsed),
            },
        })
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.ctx.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.ctx.config
    }

    /// Add a deferred task, replacing any task with the same tag.
    pub fn with_task(mut self, task: Arc<dyn DeferredTask>) -> Self {
        self.ctx.tasks.insert(task.tag().to_string(), task);
        self
    }

    /// Precache the manifest into the current generation.
    ///
    /// On failure nothing is written and the worker is discarded; the
    /// previously active worker, if any, keeps running.
    pub async fn install(self) -> Result<InstalledWorker> {
        let ctx = self.ctx;
        ctx.advance(LifecycleEvent::Install).await?;
        info!(worker = %ctx.id, cache = %ctx.config.cache_name, "Service Worker installing");

        match precache(
            &ctx.config.cache_name,
            ctx.manifest.clone(),
            &ctx.host.fetcher,
            &ctx.host.caches,
        )
        .await
        {
            Ok(precached) => {
                ctx.advance(LifecycleEvent::InstallSucceeded).await?;
                Ok(InstalledWorker {
                    ctx: Arc::new(ctx),
                    precached,
                })
            }
            Err(e) => {
                ctx.advance(LifecycleEvent::InstallFailed).await?;
                error!(
                    worker = %ctx.id,
                    category = e.category(),
                    error = %e,
                    "Service Worker install failed"
                );
                Err(e)
            }
        }
    }
}

/// An installed worker waiting to activate.
pub struct InstalledWorker {
    ctx: Arc<WorkerContext>,
    precached: Precached,
}

impl InstalledWorker {
    pub fn id(&self) -> ServiceWorkerId {
        self.ctx.id
    }

    pub fn precached(&self) -> &Precached {
        &self.precached
    }

    /// Whether to activate without waiting for open pages to close.
    pub fn skip_waiting(&self) -> bool {
        self.ctx.config.skip_waiting
    }

    pub async fn state(&self) -> WorkerState {
        self.ctx.state().await
    }

    /// Prune stale generations, claim open pages and start handling events.
    pub async fn activate(self) -> Result<ActiveWorker> {
        let ctx = self.ctx;
        ctx.advance(LifecycleEvent::Activate).await?;
        info!(worker = %ctx.id, "Service Worker activating");

        let mut activation = prune_generations(&ctx.config.cache_name, &ctx.host.caches).await;
        if ctx.config.claim_clients {
            match ctx.host.clients.claim(ctx.id).await {
                Ok(claimed) => activation.claimed = claimed,
                Err(e) => {
                    warn!(
                        worker = %ctx.id,
                        category = e.category(),
                        error = %e,
                        "Could not claim clients"
                    );
                    activation.failures.push(ActivationFailure::Claim(e));
                }
            }
        }

        ctx.advance(LifecycleEvent::ActivationComplete).await?;
        info!(
            worker = %ctx.id,
            deleted = activation.deleted.len(),
            claimed = activation.claimed,
            failures = activation.failures.len(),
            "Service Worker activated"
        );
        Ok(ActiveWorker { ctx, activation })
    }

    /// Discard a waiting worker that a newer one replaced.
    pub async fn retire(self) -> Result<()> {
        self.ctx.advance(LifecycleEvent::Superseded).await.map(|_| ())
    }
}

/// The activated worker. Handles fetch, push, notification click and sync.
pub struct ActiveWorker {
    ctx: Arc<WorkerContext>,
    activation: ActivationReport,
}

impl ActiveWorker {
    pub fn id(&self) -> ServiceWorkerId {
        self.ctx.id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.ctx.config
    }

    pub fn activation(&self) -> &ActivationReport {
        &self.activation
    }

    pub fn outbox(&self) -> &Arc<FormOutbox> {
        &self.ctx.outbox
    }

    pub async fn state(&self) -> WorkerState {
        self.ctx.state().await
    }

    /// Network-first handling of one request.
    ///
    /// Returns as soon as a response is chosen; the cache write for a
    /// cacheable response is registered on `event`.
    pub async fn handle_fetch(
        &self,
        request: &Request,
        event: &mut ExtendableEvent,
    ) -> Result<FetchOutcome> {
        if !self.state().await.controls_fetches() {
            return Ok(FetchOutcome::PassThrough(BypassReason::NoController));
        }

        let interceptor = Interceptor {
            cache_name: &self.ctx.config.cache_name,
            offline_url: &self.ctx.offline_url,
            filter: &self.ctx.filter,
            fetcher: &self.ctx.host.fetcher,
            caches: &self.ctx.host.caches,
        };
        interceptor.handle(request, event).await
    }

    /// Show a notification for a push message, if permitted.
    pub async fn handle_push(
        &self,
        data: Option<&[u8]>,
        event: &mut ExtendableEvent,
    ) -> PushOutcome {
        let permission = self.ctx.host.notifications.permission().await;
        if permission != NotificationPermission::Granted {
            debug!(?permission, "Push ignored, notifications not permitted");
            return PushOutcome::Skipped(permission);
        }

        let notification =
            Notification::from_payload(PushPayload::parse(data), &self.ctx.config.notifications);
        info!(title = %notification.title, url = %notification.data.url, "Push received");

        let host = Arc::clone(&self.ctx.host.notifications);
        let shown = notification.clone();
        event.wait_until(async move { host.show(shown).await });
        PushOutcome::Scheduled(notification)
    }

    /// Focus an open window or open one at the notification's URL.
    pub async fn handle_notification_click(
        &self,
        notification: &Notification,
    ) -> Result<ClickOutcome> {
        route_click(
            notification,
            &self.ctx.config.scope,
            self.ctx.host.notifications.as_ref(),
            self.ctx.host.clients.as_ref(),
        )
        .await
    }

    /// Run the task registered for `tag` on `event`.
    pub fn handle_sync(&self, tag: &str, event: &mut ExtendableEvent) -> SyncOutcome {
        match self.ctx.tasks.get(tag) {
            Some(task) => {
                info!(tag, "Background sync triggered");
                event.wait_until(run_to_completion(Arc::clone(task)));
                SyncOutcome::Scheduled
            }
            None => {
                debug!(tag, "No task for sync tag");
                SyncOutcome::UnknownTag
            }
        }
    }

    /// Record a sync intent. Returns false if one is already outstanding.
    pub async fn register_sync(&self, tag: &str) -> bool {
        self.ctx.sync.register(tag).await
    }

    pub async fn pending_syncs(&self) -> Vec<String> {
        self.ctx.sync.tags().await
    }

    /// Connectivity is back: fire every outstanding intent and wait for it.
    ///
    /// A task that registers its tag again while running is left pending for
    /// the next call.
    pub async fn fire_pending(&self) -> Vec<(String, SyncOutcome)> {
        let mut fired = Vec::new();
        for tag in self.ctx.sync.take_all().await {
            let mut event = ExtendableEvent::new("sync");
            let outcome = self.handle_sync(&tag, &mut event);
            event.settle().await;
            fired.push((tag, outcome));
        }
        fired
    }

    /// Queue a contact submission and ask for a form sync.
    pub async fn submit_contact(
        &self,
        submission: ContactSubmission,
    ) -> std::result::Result<usize, SubmissionError> {
        let queued = self.ctx.outbox.enqueue(submission).await?;
        self.register_sync(&self.ctx.config.sync.form_tag).await;
        Ok(queued)
    }

    /// Stop controlling pages after a newer worker took over.
    pub async fn retire(&self) -> Result<()> {
        self.ctx.advance(LifecycleEvent::Superseded).await?;
        info!(worker = %self.ctx.id, "Service Worker retired");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, MemoryCacheStorage};
    use crate::clients::{Client, ClientList};
    use crate::notify::NotificationCenter;
    use asasnaps_net::{NetError, Response};
    use async_trait::async_trait;
    use http::StatusCode;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn scope() -> Url {
        Url::parse("https://asasnaps.example/").unwrap()
    }

    /// Serves every GET with its path as body while online.
    #[derive(Default)]
    struct Origin {
        offline: AtomicBool,
    }

    #[async_trait]
    impl Fetcher for Origin {
        async fn fetch(&self, request: &Request) -> std::result::Result<Response, NetError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(NetError::RequestFailed("offline".into()));
            }
            Ok(Response::basic(
                request.url.clone(),
                StatusCode::OK,
                request.url.path().to_string(),
            ))
        }
    }

    struct Harness {
        origin: Arc<Origin>,
        caches: Arc<MemoryCacheStorage>,
        clients: Arc<ClientList>,
        center: Arc<NotificationCenter>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                origin: Arc::new(Origin::default()),
                caches: Arc::new(MemoryCacheStorage::new()),
                clients: Arc::new(ClientList::new()),
                center: Arc::new(NotificationCenter::new(NotificationPermission::Granted)),
            }
        }

        fn host(&self) -> WorkerHost {
            WorkerHost::new(
                self.caches.clone(),
                self.origin.clone(),
                self.clients.clone(),
                self.center.clone(),
            )
        }

        fn worker(&self) -> ServiceWorker {
            ServiceWorker::new(WorkerConfig::new(scope()), self.host()).unwrap()
        }

        async fn active_with(&self, config: WorkerConfig) -> ActiveWorker {
            ServiceWorker::new(config, self.host())
                .unwrap()
                .install()
                .await
                .unwrap()
                .activate()
                .await
                .unwrap()
        }

        async fn active(&self) -> ActiveWorker {
            self.worker().install().await.unwrap().activate().await.unwrap()
        }
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let harness = Harness::new();
        let config = WorkerConfig::new(scope()).with_precache(["/"]);
        assert!(matches!(
            ServiceWorker::new(config, harness.host()),
            Err(ServiceWorkerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_lifecycle_reaches_activated() {
        let harness = Harness::new();
        harness.clients.add(Client::window(scope())).await;

        let installed = harness.worker().install().await.unwrap();
        assert_eq!(installed.state().await, WorkerState::Installed);
        assert_eq!(installed.precached().entries, 15);
        assert!(installed.skip_waiting());

        let active = installed.activate().await.unwrap();
        assert_eq!(active.state().await, WorkerState::Activated);
        assert_eq!(active.activation().claimed, 1);
        assert!(active.activation().is_clean());
    }

    #[tokio::test]
    async fn test_install_failure_reports_url() {
        let harness = Harness::new();
        harness.origin.offline.store(true, Ordering::SeqCst);

        let err = harness.worker().install().await.err().unwrap();
        assert_eq!(err.category(), "install");
        assert!(harness.caches.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retired_worker_passes_through() {
        let harness = Harness::new();
        let active = harness.active().await;
        active.retire().await.unwrap();
        assert_eq!(active.state().await, WorkerState::Redundant);

        let mut event = ExtendableEvent::new("fetch");
        let outcome = active
            .handle_fetch(&Request::get(scope().join("/gallery").unwrap()), &mut event)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            FetchOutcome::PassThrough(BypassReason::NoController)
        ));
        assert!(active.retire().await.is_err());
    }

    #[tokio::test]
    async fn test_push_requires_permission() {
        let harness = Harness::new();
        harness.center.set_permission(NotificationPermission::Denied).await;
        let active = harness.active().await;

        let mut event = ExtendableEvent::new("push");
        let outcome = active.handle_push(Some(br#"{"title":"Hi"}"#), &mut event).await;
        assert_eq!(outcome, PushOutcome::Skipped(NotificationPermission::Denied));
        assert_eq!(event.pending(), 0);
    }

    #[tokio::test]
    async fn test_push_shows_after_settle() {
        let harness = Harness::new();
        let active = harness.active().await;

        let mut event = ExtendableEvent::new("push");
        let outcome = active.handle_push(Some(b"{}"), &mut event).await;
        assert!(matches!(
            outcome,
            PushOutcome::Scheduled(ref n) if n.title == "AsaSnaps Update"
        ));
        assert!(event.settle().await.is_clean());
        assert_eq!(harness.center.shown().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_sync_tag_is_ignored() {
        let harness = Harness::new();
        let active = harness.active().await;

        let mut event = ExtendableEvent::new("sync");
        assert_eq!(
            active.handle_sync("refresh-gallery", &mut event),
            SyncOutcome::UnknownTag
        );
        assert_eq!(event.pending(), 0);
    }

    fn contact() -> ContactSubmission {
        ContactSubmission {
            name: "Lerato".into(),
            email: "lerato@example.com".into(),
            subject: String::new(),
            message: "Engagement shoot?".into(),
        }
    }

    fn with_form_endpoint() -> WorkerConfig {
        let mut config = WorkerConfig::new(scope());
        config.sync.form_endpoint = Some("/api/contact".to_string());
        config
    }

    #[tokio::test]
    async fn test_contact_submission_kept_without_endpoint() {
        let harness = Harness::new();
        let active = harness.active().await;

        assert_eq!(active.submit_contact(contact()).await, Ok(1));
        assert_eq!(active.submit_contact(contact()).await, Ok(2));
        assert_eq!(active.pending_syncs().await, vec!["sync-form-data"]);

        let fired = active.fire_pending().await;
        assert_eq!(fired, vec![("sync-form-data".to_string(), SyncOutcome::Scheduled)]);
        assert_eq!(active.outbox().len().await, 2);
        assert!(active.pending_syncs().await.is_empty());
    }

    #[tokio::test]
    async fn test_contact_submission_delivered_once_online() {
        let harness = Harness::new();
        let active = harness.active_with(with_form_endpoint()).await;

        assert_eq!(active.submit_contact(contact()).await, Ok(1));
        active.fire_pending().await;
        assert!(active.outbox().is_empty().await);
        assert!(active.pending_syncs().await.is_empty());
    }

    #[tokio::test]
    async fn test_undelivered_submission_retried_on_next_sync() {
        let harness = Harness::new();
        let active = harness.active_with(with_form_endpoint()).await;
        harness.origin.offline.store(true, Ordering::SeqCst);

        active.submit_contact(contact()).await.unwrap();
        active.fire_pending().await;
        assert_eq!(active.outbox().len().await, 1);
        assert_eq!(active.pending_syncs().await, vec!["sync-form-data"]);

        harness.origin.offline.store(false, Ordering::SeqCst);
        let fired = active.fire_pending().await;
        assert_eq!(fired, vec![("sync-form-data".to_string(), SyncOutcome::Scheduled)]);
        assert!(active.outbox().is_empty().await);
        assert!(active.pending_syncs().await.is_empty());
    }

    #[tokio::test]
    async fn test_install_over_quota_leaves_no_cache() {
        let harness = Harness {
            caches: Arc::new(MemoryCacheStorage::with_quota(3)),
            ..Harness::new()
        };

        let err = harness.worker().install().await.err().unwrap();
        assert!(matches!(err, ServiceWorkerError::StorageUnavailable(_)));
        assert!(harness.caches.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_custom_task_replaces_by_tag() {
        struct Refresh;

        #[async_trait]
        impl DeferredTask for Refresh {
            fn tag(&self) -> &str {
                "refresh-gallery"
            }

            async fn run(&self) -> Result<()> {
                Ok(())
            }
        }

        let harness = Harness::new();
        let active = harness
            .worker()
            .with_task(Arc::new(Refresh))
            .install()
            .await
            .unwrap()
            .activate()
            .await
            .unwrap();

        let mut event = ExtendableEvent::new("sync");
        assert_eq!(
            active.handle_sync("refresh-gallery", &mut event),
            SyncOutcome::Scheduled
        );
        assert_eq!(event.settle().await.completed, 1);
    }

    #[tokio::test]
    async fn test_fetch_caches_into_current_generation() {
        let harness = Harness::new();
        let active = harness.active().await;
        let request = Request::get(scope().join("/gallery/image.jpg").unwrap());

        let mut event = ExtendableEvent::new("fetch");
        let outcome = active.handle_fetch(&request, &mut event).await.unwrap();
        assert_eq!(outcome.source(), "network");
        event.settle().await;

        let stored = harness
            .caches
            .match_in("asasnaps-v1", &CacheKey::from_request(&request))
            .await
            .unwrap();
        assert!(stored.is_some());
    }
}
