//! Registration: the host-side slots for waiting and active workers.
//!
//! ```text
//! Registration (scope)
//!     ├── waiting (InstalledWorker)
//!     ├── active  (Arc<ActiveWorker>) ◄── fetch / push / notificationclick / sync
//!     └── in-flight fetch events, settled in the background
//! ```
//!
//! A fetch is answered as soon as the active worker picks a response. Its
//! event keeps settling in the background; [`Registration::idle`] waits for
//! all of those to finish.

use std::sync::Arc;

use asasnaps_common::ErrorCategory;
use asasnaps_net::Request;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ServiceWorkerError;
use crate::event::{ExtendableEvent, Settled};
use crate::fetch::{BypassReason, FetchOutcome};
use crate::lifecycle::{ServiceWorkerId, WorkerState};
use crate::notify::{ClickOutcome, Notification, PushOutcome};
use crate::sync::SyncOutcome;
use crate::worker::{ActiveWorker, InstalledWorker, ServiceWorker};

/// Lifecycle notifications for the host.
#[derive(Debug, Clone)]
pub enum RegistrationEvent {
    /// A new worker started installing.
    UpdateFound { worker: ServiceWorkerId },
    /// A worker moved to a new state.
    StateChange {
        worker: ServiceWorkerId,
        state: WorkerState,
    },
    /// Install failed; the previous worker, if any, stays active.
    InstallFailed {
        worker: ServiceWorkerId,
        error: ServiceWorkerError,
    },
    /// Pages are now controlled by `worker`.
    ControllerChange { worker: ServiceWorkerId },
}

/// Worker slots for one scope.
pub struct Registration {
    scope: Url,
    waiting: Mutex<Option<InstalledWorker>>,
    active: RwLock<Option<Arc<ActiveWorker>>>,
    in_flight: Mutex<JoinSet<Settled>>,
    event_tx: mpsc::UnboundedSender<RegistrationEvent>,
}

impl Registration {
    pub fn new(scope: Url) -> (Self, mpsc::UnboundedReceiver<RegistrationEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                scope,
                waiting: Mutex::new(None),
                active: RwLock::new(None),
                in_flight: Mutex::new(JoinSet::new()),
                event_tx,
            },
            event_rx,
        )
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    fn emit(&self, event: RegistrationEvent) {
        // The host may have dropped the receiver; events are advisory.
        let _ = self.event_tx.send(event);
    }

    pub async fn active(&self) -> Option<Arc<ActiveWorker>> {
        self.active.read().await.clone()
    }

    pub async fn waiting(&self) -> Option<ServiceWorkerId> {
        self.waiting.lock().await.as_ref().map(InstalledWorker::id)
    }

    /// Install `worker`, then activate it right away if it skips waiting.
    ///
    /// A failed install leaves the current active worker in place.
    pub async fn register(
        &self,
        worker: ServiceWorker,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let id = worker.id();
        self.emit(RegistrationEvent::UpdateFound { worker: id });

        let installed = match worker.install().await {
            Ok(installed) => installed,
            Err(error) => {
                self.emit(RegistrationEvent::InstallFailed {
                    worker: id,
                    error: error.clone(),
                });
                return Err(error);
            }
        };
        self.emit(RegistrationEvent::StateChange {
            worker: id,
            state: WorkerState::Installed,
        });

        if installed.skip_waiting() {
            self.promote(installed).await?;
        } else {
            let previous = self.waiting.lock().await.replace(installed);
            if let Some(previous) = previous {
                let previous_id = previous.id();
                previous.retire().await?;
                self.emit(RegistrationEvent::StateChange {
                    worker: previous_id,
                    state: WorkerState::Redundant,
                });
            }
            info!(worker = %id, "Service Worker waiting for pages to close");
        }
        Ok(id)
    }

    /// Activate the waiting worker, if there is one.
    pub async fn activate_waiting(&self) -> Result<Option<ServiceWorkerId>, ServiceWorkerError> {
        let waiting = self.waiting.lock().await.take();
        match waiting {
            Some(installed) => {
                let id = installed.id();
                self.promote(installed).await?;
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    async fn promote(&self, installed: InstalledWorker) -> Result<(), ServiceWorkerError> {
        let active = Arc::new(installed.activate().await?);
        let id = active.id();
        let previous = self.active.write().await.replace(active);

        if let Some(previous) = previous {
            previous.retire().await?;
            self.emit(RegistrationEvent::StateChange {
                worker: previous.id(),
                state: WorkerState::Redundant,
            });
        }
        self.emit(RegistrationEvent::StateChange {
            worker: id,
            state: WorkerState::Activated,
        });
        self.emit(RegistrationEvent::ControllerChange { worker: id });
        Ok(())
    }

    /// Route a request through the active worker.
    pub async fn dispatch_fetch(
        &self,
        request: Request,
    ) -> Result<FetchOutcome, ServiceWorkerError> {
        let Some(worker) = self.active().await else {
            return Ok(FetchOutcome::PassThrough(BypassReason::NoController));
        };

        let mut event = ExtendableEvent::new("fetch");
        let outcome = worker.handle_fetch(&request, &mut event).await;

        let mut in_flight = self.in_flight.lock().await;
        while in_flight.try_join_next().is_some() {}
        if event.pending() > 0 {
            in_flight.spawn(event.settle());
        }
        outcome
    }

    pub async fn dispatch_push(
        &self,
        data: Option<&[u8]>,
    ) -> Result<PushOutcome, ServiceWorkerError> {
        let worker = self.require_active().await?;
        let mut event = ExtendableEvent::new("push");
        let outcome = worker.handle_push(data, &mut event).await;
        event.settle().await;
        Ok(outcome)
    }

    pub async fn dispatch_notification_click(
        &self,
        notification: &Notification,
    ) -> Result<ClickOutcome, ServiceWorkerError> {
        self.require_active()
            .await?
            .handle_notification_click(notification)
            .await
    }

    pub async fn dispatch_sync(&self, tag: &str) -> Result<SyncOutcome, ServiceWorkerError> {
        let worker = self.require_active().await?;
        let mut event = ExtendableEvent::new("sync");
        let outcome = worker.handle_sync(tag, &mut event);
        event.settle().await;
        Ok(outcome)
    }

    async fn require_active(&self) -> Result<Arc<ActiveWorker>, ServiceWorkerError> {
        self.active()
            .await
            .ok_or_else(|| {
                ServiceWorkerError::NotFound(format!("active worker for {}", self.scope))
            })
    }

    /// Wait for every fetch event still settling. Returns how many settled.
    pub async fn idle(&self) -> usize {
        let mut pending = std::mem::replace(&mut *self.in_flight.lock().await, JoinSet::new());
        let mut count = 0;
        while let Some(joined) = pending.join_next().await {
            count += 1;
            if let Err(e) = joined {
                warn!(error = %e, "Fetch event did not settle");
            }
        }
        debug!(count, "Registration idle");
        count
    }

    /// Retire every worker and empty the slots.
    pub async fn unregister(&self) -> bool {
        let active = self.active.write().await.take();
        let waiting = self.waiting.lock().await.take();
        let had_worker = active.is_some() || waiting.is_some();

        if let Some(active) = active {
            if let Err(e) = active.retire().await {
                warn!(category = e.category(), error = %e, "Active worker already retired");
            }
        }
        if let Some(waiting) = waiting {
            if let Err(e) = waiting.retire().await {
                warn!(category = e.category(), error = %e, "Waiting worker already retired");
            }
        }

        self.idle().await;
        info!(scope = %self.scope, had_worker, "Service Worker unregistered");
        had_worker
    }
}
