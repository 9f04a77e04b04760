//! Precache installer.
//!
//! Every manifest entry is fetched before anything is written. The batch is
//! then committed with a single [`CacheStore::put_all`], so a failed install
//! leaves no partial generation behind and two concurrent installs of the
//! same generation both end with the full manifest.

use std::sync::Arc;

use asasnaps_net::{Fetcher, Request, Response};
use futures::future::try_join_all;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheKey, CacheStore};
use crate::error::ServiceWorkerError;

/// Summary of a completed precache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Precached {
    pub cache_name: String,
    pub entries: usize,
}

async fn fetch_entry(
    fetcher: &dyn Fetcher,
    url: Url,
) -> Result<(CacheKey, Response), ServiceWorkerError> {
    let request = Request::get(url);
    let response = fetcher
        .fetch(&request)
        .await
        .map_err(|e| ServiceWorkerError::InstallFailed {
            url: request.url.to_string(),
            reason: e.to_string(),
        })?;

    if !response.ok() {
        return Err(ServiceWorkerError::InstallFailed {
            url: request.url.to_string(),
            reason: format!("status {}", response.status),
        });
    }

    debug!(
        url = %request.url,
        status = %response.status,
        bytes = response.body().len(),
        "Precache entry fetched"
    );
    Ok((CacheKey::from_request(&request), response))
}

/// Fetch `manifest` and commit it to `cache_name` in one write.
pub(crate) async fn precache(
    cache_name: &str,
    manifest: Vec<Url>,
    fetcher: &Arc<dyn Fetcher>,
    caches: &Arc<dyn CacheStore>,
) -> Result<Precached, ServiceWorkerError> {
    info!(cache = cache_name, entries = manifest.len(), "Caching app shell");

    let fetches = manifest
        .into_iter()
        .map(|url| fetch_entry(fetcher.as_ref(), url));
    let entries = match try_join_all(fetches).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(cache = cache_name, error = %e, "Precache aborted, nothing written");
            return Err(e);
        }
    };

    // put_all creates the cache only once the whole batch is accepted
    let count = entries.len();
    if let Err(e) = caches.put_all(cache_name, entries).await {
        warn!(cache = cache_name, error = %e, "Precache rejected by storage, nothing written");
        return Err(e);
    }

    info!(cache = cache_name, entries = count, "App shell cached");
    Ok(Precached {
        cache_name: cache_name.to_string(),
        entries: count,
    })
}
