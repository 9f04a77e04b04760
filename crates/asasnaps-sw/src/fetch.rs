//! Network-first fetch interception.
//!
//! ```text
//! request ──filter──► bypass ───────────────────────────────► PassThrough
//!            │
//!            └──► network ──ok, 200, basic──► cache write (extended) ─► Network
//!                    │     └─ok, anything else──────────────────────► Network
//!                    └──err──► cache (all generations) ──hit─────────► Cached
//!                                    └──miss──► offline document ──hit► Offline
//!                                                     └──miss─────────► NoFallback
//! ```

use std::sync::Arc;

use asasnaps_common::ErrorCategory;
use asasnaps_net::{first_match, Fetcher, Request, Response, UrlPattern};
use http::Method;
use tracing::{debug, trace, warn};
use url::Url;

use crate::cache::{CacheKey, CacheStore};
use crate::config::WorkerConfig;
use crate::error::ServiceWorkerError;
use crate::event::ExtendableEvent;

/// Why a request was left to the network untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BypassReason {
    /// Only GET requests are intercepted.
    Method(Method),
    /// Only http and https are intercepted.
    Scheme(String),
    /// URL matched a bypass pattern (dev tooling, browser extensions).
    Denylisted(String),
    /// No active worker controls the page.
    NoController,
}

/// Filter stage decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Intercept,
    Bypass(BypassReason),
}

/// Eligibility rules for interception.
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    bypass: Vec<UrlPattern>,
}

impl RequestFilter {
    pub fn new(bypass: Vec<UrlPattern>) -> Self {
        Self { bypass }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.bypass.clone())
    }

    pub fn decide(&self, request: &Request) -> FilterDecision {
        if request.method != Method::GET {
            return FilterDecision::Bypass(BypassReason::Method(request.method.clone()));
        }
        if !matches!(request.url.scheme(), "http" | "https") {
            return FilterDecision::Bypass(BypassReason::Scheme(request.url.scheme().to_string()));
        }
        if let Some(pattern) = first_match(&self.bypass, &request.url) {
            return FilterDecision::Bypass(BypassReason::Denylisted(pattern.pattern.clone()));
        }
        FilterDecision::Intercept
    }
}

/// Result of handling one intercepted request.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Not intercepted; the page fetches on its own.
    PassThrough(BypassReason),
    /// Live network response.
    Network(Response),
    /// Network failed; served from cache.
    Cached(Response),
    /// Network and cache missed; served the offline document.
    Offline(Response),
}

impl FetchOutcome {
    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchOutcome::PassThrough(_) => None,
            FetchOutcome::Network(r) | FetchOutcome::Cached(r) | FetchOutcome::Offline(r) => {
                Some(r)
            }
        }
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            FetchOutcome::PassThrough(_) => None,
            FetchOutcome::Network(r) | FetchOutcome::Cached(r) | FetchOutcome::Offline(r) => {
                Some(r)
            }
        }
    }

    pub fn source(&self) -> &'static str {
        match self {
            FetchOutcome::PassThrough(_) => "passthrough",
            FetchOutcome::Network(_) => "network",
            FetchOutcome::Cached(_) => "cache",
            FetchOutcome::Offline(_) => "offline",
        }
    }
}

/// Everything the interceptor needs, borrowed from the worker.
pub(crate) struct Interceptor<'a> {
    pub cache_name: &'a str,
    pub offline_url: &'a Url,
    pub filter: &'a RequestFilter,
    pub fetcher: &'a Arc<dyn Fetcher>,
    pub caches: &'a Arc<dyn CacheStore>,
}

impl Interceptor<'_> {
    pub(crate) async fn handle(
        &self,
        request: &Request,
        event: &mut ExtendableEvent,
    ) -> Result<FetchOutcome, ServiceWorkerError> {
        if let FilterDecision::Bypass(reason) = self.filter.decide(request) {
            trace!(url = %request.url, ?reason, "Request bypasses worker");
            return Ok(FetchOutcome::PassThrough(reason));
        }

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.is_cacheable() {
                    self.cache_in_background(request, &response, event);
                } else {
                    trace!(
                        url = %request.url,
                        status = %response.status,
                        response_type = response.response_type.as_str(),
                        "Response not cacheable"
                    );
                }
                Ok(FetchOutcome::Network(response))
            }
            Err(e) => {
                debug!(
                    url = %request.url,
                    category = e.category(),
                    error = %e,
                    "Network failed, falling back"
                );
                self.fallback(request).await
            }
        }
    }

    fn cache_in_background(
        &self,
        request: &Request,
        response: &Response,
        event: &mut ExtendableEvent,
    ) {
        let caches = Arc::clone(self.caches);
        let cache_name = self.cache_name.to_string();
        let key = CacheKey::from_request(request);
        let copy = response.clone();

        event.wait_until(async move {
            if let Err(e) = caches.put(&cache_name, key.clone(), copy).await {
                debug!(url = %key.url, category = e.category(), error = %e, "Cache write dropped");
            }
            Ok(())
        });
    }

    async fn fallback(&self, request: &Request) -> Result<FetchOutcome, ServiceWorkerError> {
        let key = CacheKey::from_request(request);
        if let Some(cached) = self.caches.match_any(&key).await? {
            debug!(url = %request.url, "Served from cache");
            return Ok(FetchOutcome::Cached(cached));
        }

        let offline_key = CacheKey::get(self.offline_url);
        match self.caches.match_any(&offline_key).await? {
            Some(offline) => {
                debug!(url = %request.url, "Served offline document");
                Ok(FetchOutcome::Offline(offline))
            }
            None => {
                warn!(
                    url = %request.url,
                    offline = %self.offline_url,
                    "No cached copy and no offline document"
                );
                Err(ServiceWorkerError::NoFallback(request.url.to_string()))
            }
        }
    }
}
