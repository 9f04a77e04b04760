//! Cache generation manager.

use std::sync::Arc;

use asasnaps_common::ErrorCategory;
use futures::future::join_all;
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::error::ServiceWorkerError;

/// A step of activation that did not complete.
#[derive(Debug, Clone)]
pub enum ActivationFailure {
    /// Cache names could not be listed; nothing was pruned.
    ListCaches(ServiceWorkerError),
    /// One stale generation could not be deleted.
    DeleteCache {
        name: String,
        error: ServiceWorkerError,
    },
    /// Open pages could not be claimed.
    Claim(ServiceWorkerError),
}

/// What activation did. Failures are reported, never fatal.
#[derive(Debug, Clone, Default)]
pub struct ActivationReport {
    /// Stale generations removed.
    pub deleted: Vec<String>,
    /// Clients newly controlled by the activated worker.
    pub claimed: usize,
    pub failures: Vec<ActivationFailure>,
}

impl ActivationReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Delete every cache generation other than `current`.
///
/// Deletions run concurrently; each one either completes or is recorded in
/// the report before this returns.
pub(crate) async fn prune_generations(
    current: &str,
    caches: &Arc<dyn CacheStore>,
) -> ActivationReport {
    let mut report = ActivationReport::default();

    let names = match caches.keys().await {
        Ok(names) => names,
        Err(e) => {
            warn!(category = e.category(), error = %e, "Could not list caches during activation");
            report.failures.push(ActivationFailure::ListCaches(e));
            return report;
        }
    };

    let stale: Vec<String> = names.into_iter().filter(|name| name != current).collect();
    let deletions = stale.iter().map(|name| async move {
        let result = caches.delete(name).await;
        (name.clone(), result)
    });

    for (name, result) in join_all(deletions).await {
        match result {
            Ok(_) => {
                info!(cache = %name, "Deleting old cache");
                report.deleted.push(name);
            }
            Err(error) => {
                warn!(
                    cache = %name,
                    category = error.category(),
                    error = %error,
                    "Old cache not deleted"
                );
                report
                    .failures
                    .push(ActivationFailure::DeleteCache { name, error });
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, MemoryCacheStorage};
    use asasnaps_net::Response;
    use async_trait::async_trait;
    use http::StatusCode;
    use url::Url;

    fn key() -> CacheKey {
        CacheKey::get(&Url::parse("https://asasnaps.example/").unwrap())
    }

    async fn seeded(names: &[&str]) -> Arc<dyn CacheStore> {
        let caches: Arc<dyn CacheStore> = Arc::new(MemoryCacheStorage::new());
        let url = Url::parse("https://asasnaps.example/").unwrap();
        for name in names {
            caches
                .put(name, key(), Response::basic(url.clone(), StatusCode::OK, name.to_string()))
                .await
                .unwrap();
        }
        caches
    }

    #[tokio::test]
    async fn test_only_current_generation_survives() {
        let caches = seeded(&["asasnaps-v1", "asasnaps-v2", "other-app"]).await;

        let report = prune_generations("asasnaps-v2", &caches).await;
        assert!(report.is_clean());
        assert_eq!(report.deleted, vec!["asasnaps-v1", "other-app"]);
        assert_eq!(caches.keys().await.unwrap(), vec!["asasnaps-v2"]);

        let survivor = caches.match_any(&key()).await.unwrap().unwrap();
        assert_eq!(survivor.text().unwrap(), "asasnaps-v2");
    }

    #[tokio::test]
    async fn test_nothing_to_prune() {
        let caches = seeded(&["asasnaps-v1"]).await;
        let report = prune_generations("asasnaps-v1", &caches).await;
        assert!(report.deleted.is_empty());
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_listing_failure_is_reported() {
        let storage = MemoryCacheStorage::new();
        storage.set_available(false);
        let caches: Arc<dyn CacheStore> = Arc::new(storage);

        let report = prune_generations("asasnaps-v1", &caches).await;
        assert!(matches!(
            report.failures.as_slice(),
            [ActivationFailure::ListCaches(ServiceWorkerError::StorageUnavailable(_))]
        ));
    }

    /// Lists fine, refuses to delete one name.
    struct Stubborn {
        inner: MemoryCacheStorage,
        keep: &'static str,
    }

    #[async_trait]
    impl CacheStore for Stubborn {
        async fn open(&self, name: &str) -> Result<(), ServiceWorkerError> {
            self.inner.open(name).await
        }
        async fn has(&self, name: &str) -> Result<bool, ServiceWorkerError> {
            self.inner.has(name).await
        }
        async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
            if name == self.keep {
                return Err(ServiceWorkerError::storage("locked"));
            }
            self.inner.delete(name).await
        }
        async fn keys(&self) -> Result<Vec<String>, ServiceWorkerError> {
            self.inner.keys().await
        }
        async fn put(
            &self,
            name: &str,
            key: CacheKey,
            response: Response,
        ) -> Result<(), ServiceWorkerError> {
            self.inner.put(name, key, response).await
        }
        async fn put_all(
            &self,
            name: &str,
            entries: Vec<(CacheKey, Response)>,
        ) -> Result<(), ServiceWorkerError> {
            self.inner.put_all(name, entries).await
        }
        async fn match_in(
            &self,
            name: &str,
            key: &CacheKey,
        ) -> Result<Option<Response>, ServiceWorkerError> {
            self.inner.match_in(name, key).await
        }
        async fn match_any(&self, key: &CacheKey) -> Result<Option<Response>, ServiceWorkerError> {
            self.inner.match_any(key).await
        }
        async fn entries(&self, name: &str) -> Result<Vec<CacheKey>, ServiceWorkerError> {
            self.inner.entries(name).await
        }
    }

    #[tokio::test]
    async fn test_each_failed_deletion_is_reported() {
        let inner = MemoryCacheStorage::new();
        for name in ["v0", "v1", "v2"] {
            inner.open(name).await.unwrap();
        }
        let caches: Arc<dyn CacheStore> = Arc::new(Stubborn { inner, keep: "v0" });

        let report = prune_generations("v2", &caches).await;
        assert_eq!(report.deleted, vec!["v1"]);
        match report.failures.as_slice() {
            [ActivationFailure::DeleteCache { name, .. }] => assert_eq!(name, "v0"),
            other => panic!("unexpected failures: {other:?}"),
        }
        assert_eq!(caches.keys().await.unwrap(), vec!["v0", "v2"]);
    }
}
