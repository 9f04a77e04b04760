//! Extendable events: the work a handler registers beyond its return.
//!
//! A handler may return (e.g. hand a response back to the page) while side
//! effects such as cache writes are still running. Those side effects must be
//! registered with [`ExtendableEvent::wait_until`]; the dispatcher awaits
//! [`ExtendableEvent::settle`] before the event counts as finished. Dropping
//! an event without settling it aborts whatever is still pending, the same
//! way a host suspending the worker early would.

use std::future::Future;

use asasnaps_common::ErrorCategory;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::ServiceWorkerError;

/// Outcome of waiting for an event's registered work.
#[derive(Debug, Default)]
pub struct Settled {
    /// Tasks that completed successfully.
    pub completed: usize,
    /// Tasks that failed or were aborted.
    pub failures: Vec<ServiceWorkerError>,
}

impl Settled {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Per-event group of pending tasks.
pub struct ExtendableEvent {
    kind: &'static str,
    tasks: JoinSet<Result<(), ServiceWorkerError>>,
}

impl ExtendableEvent {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            tasks: JoinSet::new(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Keep the event alive until `work` completes.
    pub fn wait_until<F>(&mut self, work: F)
    where
        F: Future<Output = Result<(), ServiceWorkerError>> + Send + 'static,
    {
        self.tasks.spawn(work);
    }

    /// Number of tasks not yet collected.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every registered task.
    pub async fn settle(mut self) -> Settled {
        let mut settled = Settled::default();

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => settled.completed += 1,
                Ok(Err(e)) => {
                    warn!(
                        event = self.kind,
                        category = e.category(),
                        error = %e,
                        "Extended task failed"
                    );
                    settled.failures.push(e);
                }
                Err(e) => {
                    warn!(event = self.kind, error = %e, "Extended task aborted");
                    settled
                        .failures
                        .push(ServiceWorkerError::TaskAborted(e.to_string()));
                }
            }
        }

        debug!(
            event = self.kind,
            completed = settled.completed,
            failed = settled.failures.len(),
            "Event settled"
        );
        settled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_settle_waits_for_all_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut event = ExtendableEvent::new("fetch");

        for delay in [5u64, 1, 3] {
            let counter = counter.clone();
            event.wait_until(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert_eq!(event.pending(), 3);

        let settled = event.settle().await;
        assert_eq!(settled.completed, 3);
        assert!(settled.is_clean());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_settle_collects_failures() {
        let mut event = ExtendableEvent::new("push");
        event.wait_until(async { Ok(()) });
        event.wait_until(async { Err(ServiceWorkerError::storage("quota")) });

        let settled = event.settle().await;
        assert_eq!(settled.completed, 1);
        assert_eq!(settled.failures.len(), 1);
        assert_eq!(settled.failures[0].category(), "storage");
    }

    #[tokio::test]
    async fn test_settle_reports_panicked_task() {
        let mut event = ExtendableEvent::new("sync");
        event.wait_until(async {
            let poisoned = true;
            if poisoned {
                panic!("boom");
            }
            Ok(())
        });

        let settled = event.settle().await;
        assert!(matches!(
            settled.failures.as_slice(),
            [ServiceWorkerError::TaskAborted(_)]
        ));
    }

    #[tokio::test]
    async fn test_empty_event_settles_immediately() {
        let settled = ExtendableEvent::new("activate").settle().await;
        assert_eq!(settled.completed, 0);
        assert!(settled.is_clean());
    }
}
