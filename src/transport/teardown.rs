/// Deferred backend teardown
///
/// `close()` must return immediately while the backend keeps flushing for a
/// short grace period. All closes on one adapter share a single scheduled
/// release, so the backend is released at most once.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::AbortHandle;

/// Delay between a logical close and the backend release
pub const CLOSE_GRACE_PERIOD: Duration = Duration::from_millis(40);

#[derive(Debug)]
enum TeardownState {
    Idle,
    Scheduled(Option<AbortHandle>),
    Released,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct DeferredTeardown {
    state: Arc<Mutex<TeardownState>>,
}

impl Default for DeferredTeardown {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredTeardown {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TeardownState::Idle)),
        }
    }

    /// Schedule `release` to run after `grace`.
    ///
    /// Returns false when a release is already scheduled, done or cancelled;
    /// `release` is dropped without running in that case.
    pub fn schedule<F>(&self, grace: Duration, release: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        if !matches!(*state, TeardownState::Idle) {
            tracing::trace!("[TEARDOWN] already {:?}, ignoring", *state);
            return false;
        }

        let shared = self.state.clone();
        let fire = move || {
            {
                let mut state = shared.lock();
                if !matches!(*state, TeardownState::Scheduled(_)) {
                    return;
                }
                *state = TeardownState::Released;
            }
            tracing::debug!("[TEARDOWN] releasing backend");
            release();
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let task = handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    fire();
                });
                *state = TeardownState::Scheduled(Some(task.abort_handle()));
            }
            Err(_) => {
                // closed outside a runtime, e.g. from a Drop on a plain thread
                *state = TeardownState::Scheduled(None);
                std::thread::spawn(move || {
                    std::thread::sleep(grace);
                    fire();
                });
            }
        }
        true
    }

    /// Cancel a pending release. Returns true if one was pending.
    pub fn cancel(&self) -> bool {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, TeardownState::Cancelled) {
            TeardownState::Scheduled(task) => {
                if let Some(task) = task {
                    task.abort();
                }
                true
            }
            previous => {
                *state = previous;
                false
            }
        }
    }

    pub fn is_scheduled(&self) -> bool {
        matches!(*self.state.lock(), TeardownState::Scheduled(_))
    }

    pub fn is_released(&self) -> bool {
        matches!(*self.state.lock(), TeardownState::Released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_release_after_grace_once() {
        let teardown = DeferredTeardown::new();
        let releases = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let releases = releases.clone();
            teardown.schedule(CLOSE_GRACE_PERIOD, move || {
                releases.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(teardown.is_scheduled());

        tokio::time::sleep(Duration::from_millis(39)).await;
        assert_eq!(releases.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(releases.load(Ordering::SeqCst), 1);
        assert!(teardown.is_released());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel() {
        let teardown = DeferredTeardown::new();
        let releases = Arc::new(AtomicUsize::new(0));
        let counter = releases.clone();
        teardown.schedule(CLOSE_GRACE_PERIOD, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(teardown.cancel());
        assert!(!teardown.cancel());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(releases.load(Ordering::SeqCst), 0);

        // a cancelled teardown cannot be rescheduled
        assert!(!teardown.schedule(CLOSE_GRACE_PERIOD, || {}));
    }
}
