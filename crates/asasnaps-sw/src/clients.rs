//! Clients: the open pages of this origin.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::error::ServiceWorkerError;
use crate::lifecycle::ServiceWorkerId;

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
    All,
}

impl ClientType {
    fn accepts(&self, other: ClientType) -> bool {
        *self == ClientType::All || *self == other
    }
}

/// A client (open page or worker).
#[derive(Debug, Clone, PartialEq)]
pub struct Client {
    pub id: String,
    pub url: Url,
    pub client_type: ClientType,
    pub focused: bool,
    /// Worker currently controlling this client, if any.
    pub controller: Option<ServiceWorkerId>,
}

impl Client {
    /// An uncontrolled, unfocused window client.
    pub fn window(url: Url) -> Self {
        Self {
            id: next_client_id(),
            url,
            client_type: ClientType::Window,
            focused: false,
            controller: None,
        }
    }
}

/// Host-side view of the pages a worker can reach.
#[async_trait]
pub trait ClientHost: Send + Sync {
    /// Clients of `client_type`, in the host's enumeration order.
    async fn match_all(&self, client_type: ClientType) -> Vec<Client>;

    /// Focus a window client.
    async fn focus(&self, id: &str) -> Result<Client, ServiceWorkerError>;

    /// Open a new window at `url`.
    async fn open_window(&self, url: &Url) -> Result<Client, ServiceWorkerError>;

    /// Make `controller` control every client. Returns how many changed.
    async fn claim(&self, controller: ServiceWorkerId) -> Result<usize, ServiceWorkerError>;
}

/// In-memory [`ClientHost`] keeping clients in the order they were added.
#[derive(Debug, Default)]
pub struct ClientList {
    clients: RwLock<Vec<Client>>,
}

impl ClientList {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client.
    pub async fn add(&self, client: Client) {
        self.clients.write().await.push(client);
    }

    /// Remove a client.
    pub async fn remove(&self, id: &str) -> Option<Client> {
        let mut clients = self.clients.write().await;
        let index = clients.iter().position(|c| c.id == id)?;
        Some(clients.remove(index))
    }

    /// Get a client by ID.
    pub async fn get(&self, id: &str) -> Option<Client> {
        self.clients.read().await.iter().find(|c| c.id == id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

#[async_trait]
impl ClientHost for ClientList {
    async fn match_all(&self, client_type: ClientType) -> Vec<Client> {
        self.clients
            .read()
            .await
            .iter()
            .filter(|c| client_type.accepts(c.client_type))
            .cloned()
            .collect()
    }

    async fn focus(&self, id: &str) -> Result<Client, ServiceWorkerError> {
        let mut clients = self.clients.write().await;
        let target = clients
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {}", id)))?;
        if target.client_type != ClientType::Window {
            return Err(ServiceWorkerError::client("Can only focus window clients"));
        }

        let mut focused = None;
        for client in clients.iter_mut() {
            client.focused = client.id == id;
            if client.focused {
                focused = Some(client.clone());
            }
        }
        focused.ok_or_else(|| ServiceWorkerError::NotFound(format!("client {}", id)))
    }

    async fn open_window(&self, url: &Url) -> Result<Client, ServiceWorkerError> {
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ServiceWorkerError::client(format!(
                "refusing to open {}",
                url
            )));
        }

        let mut clients = self.clients.write().await;
        for client in clients.iter_mut() {
            client.focused = false;
        }
        let client = Client {
            focused: true,
            ..Client::window(url.clone())
        };
        debug!(client = %client.id, url = %url, "Window opened");
        clients.push(client.clone());
        Ok(client)
    }

    async fn claim(&self, controller: ServiceWorkerId) -> Result<usize, ServiceWorkerError> {
        let mut clients = self.clients.write().await;
        let mut changed = 0;
        for client in clients.iter_mut() {
            if client.controller != Some(controller) {
                client.controller = Some(controller);
                changed += 1;
            }
        }
        Ok(changed)
    }
}

/// Generate a unique client id.
fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{:04x}", COUNTER.fetch_add(1, Ordering::Relaxed))
}
