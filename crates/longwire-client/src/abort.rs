//! Idempotent connection teardown.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use longwire_core::TransportResult;

#[derive(Debug, Default)]
struct Inner {
    started: AtomicBool,
    disposed: AtomicBool,
    completed: AtomicBool,
    gate: Notify,
}

impl Inner {
    fn complete(&self) {
        // Never signal the gate after disposal tore it down.
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        self.completed.store(true, Ordering::SeqCst);
        self.gate.notify_waiters();
    }
}

/// Ensures a connection teardown request is issued at most once.
///
/// The first caller of [`abort`] spawns the actual request; every caller,
/// including the first, blocks up to its own timeout on a shared wait gate
/// released when the request completes (success or failure) or when the
/// coordinator is disposed. Single-flight is a compare-and-swap, never
/// exception suppression.
///
/// [`abort`]: AbortCoordinator::abort
#[derive(Debug, Clone, Default)]
pub struct AbortCoordinator {
    inner: Arc<Inner>,
}

impl AbortCoordinator {
    /// Creates a coordinator in its initial state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues the teardown at most once and waits for completion.
    ///
    /// Returns `true` if teardown completed within `timeout`, `false` if
    /// this caller's wait timed out first. The request's own failure still
    /// counts as completion: a failed abort must not leave callers waiting
    /// forever.
    pub async fn abort<F, Fut>(&self, issue: F, timeout: Duration) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TransportResult<()>> + Send + 'static,
    {
        if self
            .inner
            .started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let inner = Arc::clone(&self.inner);
            let request = issue();
            tokio::spawn(async move {
                if let Err(err) = request.await {
                    debug!(error = %err, "abort request failed; releasing waiters anyway");
                }
                inner.complete();
            });
        }

        if self.inner.completed.load(Ordering::SeqCst) {
            return true;
        }

        // Arm the waiter before re-checking so a completion between the
        // check and the await cannot be missed.
        let notified = self.inner.gate.notified();
        if self.inner.completed.load(Ordering::SeqCst) {
            return true;
        }
        tokio::time::timeout(timeout, notified).await.is_ok()
    }

    /// Returns `true` once the teardown request has completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.completed.load(Ordering::SeqCst)
    }

    /// Tears the coordinator down, releasing any waiters.
    ///
    /// Guarded so the gate is never signalled after disposal.
    pub fn dispose(&self) {
        if self
            .inner
            .disposed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.inner.completed.store(true, Ordering::SeqCst);
            self.inner.gate.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use longwire_core::TransportError;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_n_callers_issue_one_teardown() {
        let coordinator = AbortCoordinator::new();
        let issued = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let coordinator = coordinator.clone();
            let issued = Arc::clone(&issued);
            tasks.push(tokio::spawn(async move {
                coordinator
                    .abort(
                        move || async move {
                            issued.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        },
                        Duration::from_secs(5),
                    )
                    .await
            }));
        }

        for task in tasks {
            assert!(task.await.unwrap(), "every caller observes completion");
        }
        assert_eq!(issued.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_request_still_releases_waiters() {
        let coordinator = AbortCoordinator::new();

        let completed = coordinator
            .abort(
                || async { Err(TransportError::Timeout) },
                Duration::from_secs(5),
            )
            .await;

        assert!(completed);
        assert!(coordinator.is_completed());
    }

    #[tokio::test]
    async fn test_caller_times_out_while_request_hangs() {
        let coordinator = AbortCoordinator::new();

        let completed = coordinator
            .abort(
                || async {
                    std::future::pending::<()>().await;
                    Ok(())
                },
                Duration::from_millis(20),
            )
            .await;
        assert!(!completed, "caller must observe its own timeout");
        assert!(!coordinator.is_completed());
    }

    #[tokio::test]
    async fn test_dispose_releases_waiters_once() {
        let coordinator = AbortCoordinator::new();
        coordinator.inner.started.store(true, Ordering::SeqCst);

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .abort(|| async { Ok(()) }, Duration::from_secs(5))
                    .await
            })
        };

        tokio::task::yield_now().await;
        coordinator.dispose();
        coordinator.dispose();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_completion_after_dispose_does_not_signal() {
        let coordinator = AbortCoordinator::new();
        coordinator.dispose();
        coordinator.inner.complete();
        assert!(coordinator.is_completed());
    }
}
