//! Background sync and the contact-form outbox.
//!
//! Sync intents and queued submissions live in memory only. A worker restart
//! between `register` and the sync event loses them; there is no persistence
//! layer behind this module.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, OnceLock};

use asasnaps_common::ErrorCategory;
use asasnaps_net::{Fetcher, Request};
use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderValue};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ServiceWorkerError;

/// Work run when the host fires a sync event for a tag.
#[async_trait]
pub trait DeferredTask: Send + Sync {
    fn tag(&self) -> &str;

    async fn run(&self) -> Result<(), ServiceWorkerError>;
}

/// What the sync handler did with a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Task registered on the event.
    Scheduled,
    /// No task for this tag.
    UnknownTag,
}

/// Outstanding sync intents, at most one per tag.
#[derive(Debug, Default)]
pub struct SyncManager {
    pending: Mutex<BTreeSet<String>>,
}

impl SyncManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an intent. Returns false if one is already outstanding.
    pub async fn register(&self, tag: &str) -> bool {
        let inserted = self.pending.lock().await.insert(tag.to_string());
        debug!(tag, inserted, "Sync registered");
        inserted
    }

    /// Outstanding tags, sorted.
    pub async fn tags(&self) -> Vec<String> {
        self.pending.lock().await.iter().cloned().collect()
    }

    /// Remove and return every outstanding tag.
    pub async fn take_all(&self) -> Vec<String> {
        std::mem::take(&mut *self.pending.lock().await)
            .into_iter()
            .collect()
    }
}

/// Invalid contact submission.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("Please fill in all required fields: {0} is missing")]
    MissingField(&'static str),

    #[error("Please enter a valid email address: {0}")]
    InvalidEmail(String),
}

/// A contact-form submission.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContactSubmission {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub subject: String,
    pub message: String,
}

fn email_regex() -> &'static Regex {
    static EMAIL: OnceLock<Regex> = OnceLock::new();
    EMAIL.get_or_init(|| {
        Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex")
    })
}

impl ContactSubmission {
    /// Name, email and message are required; subject is optional.
    pub fn validate(&self) -> Result<(), SubmissionError> {
        for (field, value) in [
            ("name", &self.name),
            ("email", &self.email),
            ("message", &self.message),
        ] {
            if value.trim().is_empty() {
                return Err(SubmissionError::MissingField(field));
            }
        }
        if !email_regex().is_match(&self.email) {
            return Err(SubmissionError::InvalidEmail(self.email.clone()));
        }
        Ok(())
    }
}

/// Queue of submissions waiting for connectivity.
#[derive(Debug, Default)]
pub struct FormOutbox {
    queue: Mutex<VecDeque<ContactSubmission>>,
}

impl FormOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and queue. Returns the queue length.
    pub async fn enqueue(&self, submission: ContactSubmission) -> Result<usize, SubmissionError> {
        submission.validate()?;
        let mut queue = self.queue.lock().await;
        queue.push_back(submission);
        Ok(queue.len())
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    async fn drain(&self) -> Vec<ContactSubmission> {
        self.queue.lock().await.drain(..).collect()
    }

    /// Put failed submissions back ahead of anything queued meanwhile.
    async fn requeue(&self, failed: Vec<ContactSubmission>) {
        let mut queue = self.queue.lock().await;
        for submission in failed.into_iter().rev() {
            queue.push_front(submission);
        }
    }
}

/// Flushes the [`FormOutbox`] on the form sync tag.
///
/// Undelivered submissions are requeued and the tag is registered again on
/// `sync`, so the next connectivity change retries them.
pub struct FormDataSync {
    tag: String,
    outbox: Arc<FormOutbox>,
    sync: Arc<SyncManager>,
    endpoint: Option<Url>,
    fetcher: Arc<dyn Fetcher>,
}

impl FormDataSync {
    pub fn new(
        tag: impl Into<String>,
        outbox: Arc<FormOutbox>,
        sync: Arc<SyncManager>,
        endpoint: Option<Url>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            tag: tag.into(),
            outbox,
            sync,
            endpoint,
            fetcher,
        }
    }

    async fn send(
        &self,
        endpoint: &Url,
        submission: &ContactSubmission,
    ) -> Result<(), ServiceWorkerError> {
        let body = serde_json::to_vec(submission)
            .map_err(|e| ServiceWorkerError::Network(e.to_string()))?;
        let request = Request::post(endpoint.clone(), Bytes::from(body)).header(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let response = self.fetcher.fetch(&request).await?;
        if !response.ok() {
            return Err(ServiceWorkerError::Network(format!(
                "form endpoint answered {}",
                response.status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DeferredTask for FormDataSync {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn run(&self) -> Result<(), ServiceWorkerError> {
        let Some(endpoint) = self.endpoint.as_ref() else {
            let count = self.outbox.len().await;
            info!(
                count = count,
                "Processing form data in the background, no endpoint configured"
            );
            return Ok(());
        };

        let queued = self.outbox.drain().await;
        info!(count = queued.len(), "Processing form data in the background");

        let mut failed = Vec::new();
        for submission in queued {
            if let Err(e) = self.send(endpoint, &submission).await {
                warn!(
                    category = e.category(),
                    error = %e,
                    "Form submission not delivered, requeued"
                );
                failed.push(submission);
            }
        }
        if !failed.is_empty() {
            let count = failed.len();
            self.outbox.requeue(failed).await;
            self.sync.register(&self.tag).await;
            info!(tag = %self.tag, count, "Form sync registered again");
        }
        Ok(())
    }
}

/// Run `task`, turning any failure into a logged success so the host does
/// not keep retrying the sync.
pub(crate) async fn run_to_completion(
    task: Arc<dyn DeferredTask>,
) -> Result<(), ServiceWorkerError> {
    if let Err(e) = task.run().await {
        warn!(tag = task.tag(), category = e.category(), error = %e, "Deferred task failed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use asasnaps_net::{NetError, Response};
    use http::{Method, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn submission(name: &str) -> ContactSubmission {
        ContactSubmission {
            name: name.to_string(),
            email: "client@example.com".to_string(),
            subject: "Wedding".to_string(),
            message: "Are you free in June?".to_string(),
        }
    }

    /// Accepts POSTs until `fail_after` deliveries, then refuses.
    struct Endpoint {
        delivered: AtomicUsize,
        fail_after: usize,
    }

    #[async_trait]
    impl Fetcher for Endpoint {
        async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
            assert_eq!(request.method, Method::POST);
            if self.delivered.load(Ordering::SeqCst) >= self.fail_after {
                return Err(NetError::RequestFailed("offline".into()));
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(Response::basic(request.url.clone(), StatusCode::CREATED, ""))
        }
    }

    fn endpoint(fail_after: usize) -> Arc<Endpoint> {
        Arc::new(Endpoint {
            delivered: AtomicUsize::new(0),
            fail_after,
        })
    }

    fn api() -> Option<Url> {
        Some(Url::parse("https://asasnaps.example/api/contact").unwrap())
    }

    fn form_sync(
        outbox: &Arc<FormOutbox>,
        sync: &Arc<SyncManager>,
        endpoint: Option<Url>,
        fetcher: Arc<Endpoint>,
    ) -> FormDataSync {
        FormDataSync::new(
            "sync-form-data",
            Arc::clone(outbox),
            Arc::clone(sync),
            endpoint,
            fetcher,
        )
    }

    #[test]
    fn test_email_pattern_compiles() {
        assert!(email_regex().is_match("client@example.com"));
        assert!(!email_regex().is_match("client@example"));
    }

    #[test]
    fn test_validate_submission() {
        assert!(submission("Thandi").validate().is_ok());

        let blank = ContactSubmission {
            name: "   ".to_string(),
            ..submission("x")
        };
        assert_eq!(blank.validate(), Err(SubmissionError::MissingField("name")));

        let no_subject = ContactSubmission {
            subject: String::new(),
            ..submission("Thandi")
        };
        assert!(no_subject.validate().is_ok());

        for bad in ["plain", "a@b", "a b@c.d", "@c.d"] {
            let s = ContactSubmission {
                email: bad.to_string(),
                ..submission("Thandi")
            };
            assert!(
                matches!(s.validate(), Err(SubmissionError::InvalidEmail(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_sync_manager_dedupes_tags() {
        let manager = SyncManager::new();
        assert!(manager.register("sync-form-data").await);
        assert!(!manager.register("sync-form-data").await);
        assert!(manager.register("refresh-gallery").await);
        assert_eq!(manager.tags().await, vec!["refresh-gallery", "sync-form-data"]);

        assert_eq!(manager.take_all().await.len(), 2);
        assert!(manager.tags().await.is_empty());
    }

    #[tokio::test]
    async fn test_outbox_rejects_invalid() {
        let outbox = FormOutbox::new();
        let bad = ContactSubmission {
            email: "nope".into(),
            ..submission("x")
        };
        assert!(outbox.enqueue(bad).await.is_err());
        assert!(outbox.is_empty().await);
        assert_eq!(outbox.enqueue(submission("a")).await, Ok(1));
    }

    #[tokio::test]
    async fn test_flush_delivers_everything() {
        let outbox = Arc::new(FormOutbox::new());
        outbox.enqueue(submission("a")).await.unwrap();
        outbox.enqueue(submission("b")).await.unwrap();
        let sync = Arc::new(SyncManager::new());
        let fetcher = endpoint(usize::MAX);

        let task = form_sync(&outbox, &sync, api(), fetcher.clone());
        task.run().await.unwrap();

        assert!(outbox.is_empty().await);
        assert_eq!(fetcher.delivered.load(Ordering::SeqCst), 2);
        assert!(sync.tags().await.is_empty());
    }

    #[tokio::test]
    async fn test_flush_requeues_failures_in_order() {
        let outbox = Arc::new(FormOutbox::new());
        for name in ["a", "b", "c"] {
            outbox.enqueue(submission(name)).await.unwrap();
        }

        let sync = Arc::new(SyncManager::new());

        let task = form_sync(&outbox, &sync, api(), endpoint(1));
        assert!(task.run().await.is_ok());

        let remaining: Vec<String> = outbox.drain().await.into_iter().map(|s| s.name).collect();
        assert_eq!(remaining, vec!["b", "c"]);
        assert_eq!(sync.tags().await, vec!["sync-form-data"]);
    }

    #[tokio::test]
    async fn test_flush_without_endpoint_keeps_submissions() {
        let outbox = Arc::new(FormOutbox::new());
        outbox.enqueue(submission("a")).await.unwrap();
        outbox.enqueue(submission("b")).await.unwrap();
        let sync = Arc::new(SyncManager::new());
        let fetcher = endpoint(usize::MAX);

        let task = form_sync(&outbox, &sync, None, fetcher.clone());
        task.run().await.unwrap();

        assert_eq!(outbox.len().await, 2);
        assert_eq!(fetcher.delivered.load(Ordering::SeqCst), 0);
        assert!(sync.tags().await.is_empty());
    }

    struct Failing;

    #[async_trait]
    impl DeferredTask for Failing {
        fn tag(&self) -> &str {
            "always-fails"
        }

        async fn run(&self) -> Result<(), ServiceWorkerError> {
            Err(ServiceWorkerError::Network("offline".into()))
        }
    }

    #[tokio::test]
    async fn test_run_to_completion_never_rejects() {
        assert!(run_to_completion(Arc::new(Failing)).await.is_ok());
    }
}
