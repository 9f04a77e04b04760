//! Cache storage: named generations of Request → Response pairs.
//!
//! ```text
//! CacheStore (caches)
//!     ├── "asasnaps-v1" ── CacheKey → CacheEntry
//!     └── "asasnaps-v2" ── CacheKey → CacheEntry
//! ```
//!
//! Writes are insert-or-replace by key; there is no read-modify-write, so
//! concurrent writers to the same key simply race and the last one wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use asasnaps_common::now_millis;
use asasnaps_net::{Request, Response};
use async_trait::async_trait;
use hashbrown::HashMap;
use http::Method;
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::error::ServiceWorkerError;

type Result<T> = std::result::Result<T, ServiceWorkerError>;

/// Normalized request descriptor: method plus absolute URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: Method,
    pub url: String,
}

impl CacheKey {
    pub fn new(method: Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method,
            url: url.into(),
        }
    }

    /// GET key for `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn from_request(request: &Request) -> Self {
        Self::new(request.method.clone(), &request.url)
    }
}

/// A cached request/response pair.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub response: Response,
    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

/// Versioned, named store of cached responses.
///
/// Every operation may fail with [`ServiceWorkerError::StorageUnavailable`];
/// callers decide whether that is fatal.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Open a cache, creating it if absent.
    async fn open(&self, name: &str) -> Result<()>;

    /// Check if a cache exists.
    async fn has(&self, name: &str) -> Result<bool>;

    /// Delete a cache. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool>;

    /// All cache names, oldest first.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Insert or replace one entry, creating the cache if absent.
    async fn put(&self, name: &str, key: CacheKey, response: Response) -> Result<()>;

    /// Insert or replace all entries at once; nothing is written on failure.
    async fn put_all(&self, name: &str, entries: Vec<(CacheKey, Response)>) -> Result<()>;

    /// Match within one cache.
    async fn match_in(&self, name: &str, key: &CacheKey) -> Result<Option<Response>>;

    /// Match across every cache, oldest generation first.
    async fn match_any(&self, key: &CacheKey) -> Result<Option<Response>>;

    /// Keys stored in one cache, in insertion order.
    async fn entries(&self, name: &str) -> Result<Vec<CacheKey>>;
}

/// Handle to a single opened cache.
#[derive(Clone)]
pub struct CacheHandle {
    name: String,
    store: Arc<dyn CacheStore>,
}

impl CacheHandle {
    /// Open (or create) `name` in `store`.
    pub async fn open(store: Arc<dyn CacheStore>, name: &str) -> Result<Self> {
        store.open(name).await?;
        Ok(Self {
            name: name.to_string(),
            store,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn put(&self, key: CacheKey, response: Response) -> Result<()> {
        self.store.put(&self.name, key, response).await
    }

    pub async fn put_all(&self, entries: Vec<(CacheKey, Response)>) -> Result<()> {
        self.store.put_all(&self.name, entries).await
    }

    pub async fn match_request(&self, key: &CacheKey) -> Result<Option<Response>> {
        self.store.match_in(&self.name, key).await
    }

    pub async fn keys(&self) -> Result<Vec<CacheKey>> {
        self.store.entries(&self.name).await
    }
}

/// A cache instance.
#[derive(Debug, Default)]
struct Cache {
    entries: HashMap<CacheKey, CacheEntry>,
    order: Vec<CacheKey>,
}

impl Cache {
    fn put(&mut self, key: CacheKey, response: Response) {
        if self.entries.contains_key(&key) {
            self.order.retain(|k| k != &key);
        }
        self.order.push(key.clone());
        let entry = CacheEntry {
            key: key.clone(),
            response,
            cached_at: now_millis(),
        };
        self.entries.insert(key, entry);
    }

    fn match_request(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Default)]
struct Inner {
    caches: HashMap<String, Cache>,
    order: Vec<String>,
}

impl Inner {
    fn open(&mut self, name: &str) -> &mut Cache {
        if !self.caches.contains_key(name) {
            self.order.push(name.to_string());
        }
        self.caches.entry(name.to_string()).or_default()
    }

    fn total_entries(&self) -> usize {
        self.caches.values().map(Cache::len).sum()
    }

    /// Entries `name` would hold after inserting `keys`.
    fn growth(&self, name: &str, keys: &[&CacheKey]) -> usize {
        let existing = self.caches.get(name);
        let mut fresh: Vec<&CacheKey> = keys
            .iter()
            .copied()
            .filter(|k| existing.map_or(true, |c| !c.entries.contains_key(*k)))
            .collect();
        fresh.sort_by(|a, b| (&a.url, a.method.as_str()).cmp(&(&b.url, b.method.as_str())));
        fresh.dedup();
        fresh.len()
    }
}

/// In-memory [`CacheStore`] with an optional entry quota.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    inner: RwLock<Inner>,
    max_entries: Option<usize>,
    unavailable: AtomicBool,
}

impl MemoryCacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that refuses writes past `max_entries` total entries.
    pub fn with_quota(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries),
            ..Self::default()
        }
    }

    /// Simulate storage being disabled (e.g. private browsing).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(ServiceWorkerError::storage("cache storage is disabled"))
        } else {
            Ok(())
        }
    }

    fn check_quota(&self, inner: &Inner, name: &str, keys: &[&CacheKey]) -> Result<()> {
        if let Some(max) = self.max_entries {
            let after = inner.total_entries() + inner.growth(name, keys);
            if after > max {
                return Err(ServiceWorkerError::storage(format!(
                    "quota exceeded: {} entries > {}",
                    after, max
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<()> {
        self.check_available()?;
        self.inner.write().await.open(name);
        Ok(())
    }

    async fn has(&self, name: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.inner.read().await.caches.contains_key(name))
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let existed = inner.caches.remove(name).is_some();
        if existed {
            inner.order.retain(|n| n != name);
            debug!(cache = name, "Cache deleted");
        }
        Ok(existed)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.check_available()?;
        Ok(self.inner.read().await.order.clone())
    }

    async fn put(&self, name: &str, key: CacheKey, response: Response) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        self.check_quota(&inner, name, &[&key])?;
        trace!(cache = name, url = %key.url, "Cache put");
        inner.open(name).put(key, response);
        Ok(())
    }

    async fn put_all(&self, name: &str, entries: Vec<(CacheKey, Response)>) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.write().await;
        let keys: Vec<&CacheKey> = entries.iter().map(|(k, _)| k).collect();
        self.check_quota(&inner, name, &keys)?;

        let count = entries.len();
        let cache = inner.open(name);
        for (key, response) in entries {
            cache.put(key, response);
        }
        debug!(cache = name, count, "Cache populated");
        Ok(())
    }

    async fn match_in(&self, name: &str, key: &CacheKey) -> Result<Option<Response>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .caches
            .get(name)
            .and_then(|c| c.match_request(key))
            .map(|e| e.response.clone()))
    }

    async fn match_any(&self, key: &CacheKey) -> Result<Option<Response>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        Ok(inner
            .order
            .iter()
            .filter_map(|name| inner.caches.get(name))
            .find_map(|c| c.match_request(key))
            .map(|e| e.response.clone()))
    }

    async fn entries(&self, name: &str) -> Result<Vec<CacheKey>> {
        self.check_available()?;
        let inner = self.inner.read().await;
        inner
            .caches
            .get(name)
            .map(|c| c.order.clone())
            .ok_or_else(|| ServiceWorkerError::NotFound(name.to_string()))
    }
}
