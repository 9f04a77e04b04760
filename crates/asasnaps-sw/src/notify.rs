//! Push notifications and notification clicks.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

use crate::clients::{Client, ClientHost, ClientType};
use crate::config::NotificationConfig;
use crate::error::ServiceWorkerError;

/// Notification permission granted to the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotificationPermission {
    /// User has not decided; treated as not granted.
    #[default]
    Default,
    Granted,
    Denied,
}

/// Unique identifier for a displayed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct NotificationId(u64);

impl NotificationId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Push payload with every field optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub url: Option<String>,
}

impl PushPayload {
    /// Parse leniently: absent data, invalid JSON, non-objects, wrongly typed
    /// or empty fields all count as missing.
    pub fn parse(data: Option<&[u8]>) -> Self {
        let value = match data.map(serde_json::from_slice::<JsonValue>) {
            Some(Ok(value)) => value,
            Some(Err(e)) => {
                debug!(error = %e, "Push payload is not JSON, using defaults");
                return Self::default();
            }
            None => return Self::default(),
        };

        let field = |name: &str| {
            value
                .get(name)
                .and_then(JsonValue::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Self {
            title: field("title"),
            body: field("body"),
            url: field("url"),
        }
    }
}

/// Data attached to a notification for the click handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationData {
    pub url: String,
}

/// A notification ready for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub data: NotificationData,
}

impl Notification {
    /// Fill `payload` gaps from `config`.
    pub fn from_payload(payload: PushPayload, config: &NotificationConfig) -> Self {
        Self {
            id: NotificationId::new(),
            title: payload.title.unwrap_or_else(|| config.default_title.clone()),
            body: payload.body.unwrap_or_else(|| config.default_body.clone()),
            icon: config.icon.clone(),
            badge: config.badge.clone(),
            vibrate: config.vibrate.clone(),
            data: NotificationData {
                url: payload.url.unwrap_or_else(|| config.default_url.clone()),
            },
        }
    }
}

/// What the push handler did.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// Permission not granted; nothing shown.
    Skipped(NotificationPermission),
    /// Display registered on the event.
    Scheduled(Notification),
}

/// What the click handler did.
#[derive(Debug, Clone, PartialEq)]
pub enum ClickOutcome {
    Focused(Client),
    Opened(Client),
}

/// Host-side notification display.
#[async_trait]
pub trait NotificationHost: Send + Sync {
    async fn permission(&self) -> NotificationPermission;

    async fn show(&self, notification: Notification) -> Result<(), ServiceWorkerError>;

    /// Close a notification. Returns whether it was still shown.
    async fn close(&self, id: NotificationId) -> bool;
}

/// In-memory [`NotificationHost`].
#[derive(Debug, Default)]
pub struct NotificationCenter {
    permission: RwLock<NotificationPermission>,
    shown: RwLock<Vec<Notification>>,
}

impl NotificationCenter {
    pub fn new(permission: NotificationPermission) -> Self {
        Self {
            permission: RwLock::new(permission),
            shown: RwLock::new(Vec::new()),
        }
    }

    pub async fn set_permission(&self, permission: NotificationPermission) {
        *self.permission.write().await = permission;
    }

    /// Notifications currently displayed.
    pub async fn shown(&self) -> Vec<Notification> {
        self.shown.read().await.clone()
    }
}

#[async_trait]
impl NotificationHost for NotificationCenter {
    async fn permission(&self) -> NotificationPermission {
        *self.permission.read().await
    }

    async fn show(&self, notification: Notification) -> Result<(), ServiceWorkerError> {
        if self.permission().await != NotificationPermission::Granted {
            return Err(ServiceWorkerError::Notification(
                "permission not granted".to_string(),
            ));
        }
        self.shown.write().await.push(notification);
        Ok(())
    }

    async fn close(&self, id: NotificationId) -> bool {
        let mut shown = self.shown.write().await;
        let before = shown.len();
        shown.retain(|n| n.id != id);
        shown.len() != before
    }
}

/// Focus the first open window, or open one at the notification's URL.
pub(crate) async fn route_click(
    notification: &Notification,
    scope: &Url,
    notifications: &dyn NotificationHost,
    clients: &dyn ClientHost,
) -> Result<ClickOutcome, ServiceWorkerError> {
    notifications.close(notification.id).await;

    let windows = clients.match_all(ClientType::Window).await;
    if let Some(first) = windows.first() {
        let focused = clients.focus(&first.id).await?;
        info!(client = %focused.id, "Notification click focused existing window");
        return Ok(ClickOutcome::Focused(focused));
    }

    let target = resolve_click_target(scope, &notification.data.url);
    let opened = clients.open_window(&target).await?;
    info!(client = %opened.id, url = %target, "Notification click opened window");
    Ok(ClickOutcome::Opened(opened))
}

fn resolve_click_target(scope: &Url, url: &str) -> Url {
    let url = if url.is_empty() { "/" } else { url };
    scope.join(url).unwrap_or_else(|e| {
        debug!(url, error = %e, "Unresolvable click target, using scope");
        scope.clone()
    })
}
