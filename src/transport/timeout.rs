/// Deadline racing for ping
///
/// [`race`] runs an operation against a timer and turns expiry into
/// [`TransportError::Timeout`]. [`PingSlot`] is the single pending-pong slot
/// used by backends that answer pings through an event instead of a future.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::TransportError;

/// Ping deadline when the caller gives none
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(1000);

/// Race `operation` against `deadline`.
///
/// Whichever finishes first wins; the losing future is dropped, so a
/// response arriving after the deadline has nowhere to go.
pub async fn race<F, T>(operation: &'static str, deadline: Duration, future: F) -> Result<T, TransportError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(deadline, future)
        .await
        .map_err(|_| TransportError::timeout_error(operation, deadline))
}

/// Pong payload, `None` when the backend reported a failed ping
pub type PongPayload = Option<Bytes>;

/// One in-flight ping at a time, guarded by a generation counter.
///
/// Arming a new ping replaces the previous waiter. The replaced waiter sees
/// its channel close and resolves to an absent result; this is the known
/// overlapping-ping race and is not prevented.
#[derive(Debug, Default)]
pub struct PingSlot {
    generation: AtomicU64,
    pending: Mutex<Option<(u64, oneshot::Sender<PongPayload>)>>,
}

impl PingSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter, returning its generation and receiver
    pub fn arm(&self) -> (u64, oneshot::Receiver<PongPayload>) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let (tx, rx) = oneshot::channel();
        if self.pending.lock().replace((generation, tx)).is_some() {
            tracing::debug!("[PING] ping #{} replaced an unanswered ping", generation);
        }
        (generation, rx)
    }

    /// Hand the pong of ping `generation` to its waiter.
    ///
    /// Returns false when that ping is no longer pending: it timed out, or a
    /// newer ping replaced it. The pending waiter, if any, keeps waiting.
    pub fn complete(&self, generation: u64, payload: PongPayload) -> bool {
        let mut pending = self.pending.lock();
        match pending.take() {
            Some((current, tx)) if current == generation => {
                tracing::debug!("[PING] pong for ping #{}", generation);
                tx.send(payload).is_ok()
            }
            other => {
                tracing::trace!("[PING] dropping late pong for ping #{}", generation);
                *pending = other;
                false
            }
        }
    }

    /// Forget the waiter of `generation` after its deadline passed
    pub fn disarm(&self, generation: u64) {
        let mut pending = self.pending.lock();
        if matches!(pending.as_ref(), Some((current, _)) if *current == generation) {
            pending.take();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.pending.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_race_times_out() {
        let started = tokio::time::Instant::now();
        let err = race("ping", Duration::from_millis(500), std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(500) && elapsed < Duration::from_millis(550));
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_returns_live_response() {
        let reply = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            "MOTD;1.21.50;10".to_string()
        };
        let payload = race("ping", Duration::from_millis(500), reply).await.unwrap();
        assert_eq!(payload, "MOTD;1.21.50;10");
    }

    #[tokio::test]
    async fn test_slot_ignores_late_pong() {
        let slot = PingSlot::new();
        let (generation, rx) = slot.arm();
        slot.disarm(generation);
        drop(rx);

        assert!(!slot.complete(generation, Some(Bytes::from_static(b"late"))));
        assert!(!slot.is_armed());
    }

    #[tokio::test]
    async fn test_slot_keeps_waiter_on_stale_pong() {
        let slot = PingSlot::new();
        let (first, first_rx) = slot.arm();
        slot.disarm(first);
        drop(first_rx);

        let (second, second_rx) = slot.arm();
        assert!(!slot.complete(first, Some(Bytes::from_static(b"answer-for-ping-1"))));
        assert!(slot.is_armed());

        assert!(slot.complete(second, Some(Bytes::from_static(b"answer-for-ping-2"))));
        assert_eq!(second_rx.await.unwrap(), Some(Bytes::from_static(b"answer-for-ping-2")));
    }

    #[tokio::test]
    async fn test_slot_overwrite() {
        let slot = PingSlot::new();
        let (first, first_rx) = slot.arm();
        let (second, second_rx) = slot.arm();
        assert!(second > first);

        // disarming a stale generation leaves the current waiter alone
        slot.disarm(first);
        assert!(slot.is_armed());

        assert!(!slot.complete(first, Some(Bytes::from_static(b"old"))));
        assert!(slot.complete(second, Some(Bytes::from_static(b"pong"))));
        assert!(first_rx.await.is_err());
        assert_eq!(second_rx.await.unwrap(), Some(Bytes::from_static(b"pong")));
    }
}
