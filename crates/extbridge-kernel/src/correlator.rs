//! Request correlator.
//!
//! One [`Correlator`] exists per connection.  It hands out monotonically
//! increasing call ids, keeps a [`PendingCall`] for every call in flight, and
//! resolves each one exactly once: with the peer's answer, a local deadline,
//! a disconnect, or an explicit remote error.
//!
//! The single-resolution guarantee comes from ownership rather than from a
//! flag.  Resolution *removes* the entry from the pending table and consumes
//! its [`oneshot::Sender`], so whichever path removes the entry first is the
//! only one that can write the result.  Every later attempt finds nothing and
//! reports `false`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{KernelError, Result};
use crate::frame::{CallId, CallKind};

/// Receiving side of one call's result slot.
pub type ResultSlot = oneshot::Receiver<Result<Value>>;

// ---------------------------------------------------------------------------
// Pending calls
// ---------------------------------------------------------------------------

/// Bookkeeping for one in-flight call.
struct PendingCall {
    kind: CallKind,
    submitted_at: Instant,
    slot: oneshot::Sender<Result<Value>>,
}

// ---------------------------------------------------------------------------
// Correlator
// ---------------------------------------------------------------------------

/// Pairs outgoing calls with their eventual resolution.
///
/// Cheaply cloneable; all clones share the same pending table.
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<CorrelatorInner>,
}

struct CorrelatorInner {
    peer: String,
    next_id: AtomicU64,
    pending: DashMap<CallId, PendingCall>,
    closed: AtomicBool,
}

impl Correlator {
    /// Create a correlator for calls addressed to `peer`.
    #[must_use]
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(CorrelatorInner {
                peer: peer.into(),
                next_id: AtomicU64::new(1),
                pending: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Allocate a call id and its pending entry.  The deadline, if any, is
    /// applied by [`wait`](Self::wait).
    ///
    /// On a correlator that has already been failed, the returned slot is
    /// resolved with `PeerDisconnected` before this returns.
    pub fn register(&self, kind: CallKind) -> (CallId, ResultSlot) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        self.inner.pending.insert(
            id,
            PendingCall {
                kind,
                submitted_at: Instant::now(),
                slot: tx,
            },
        );

        // `fail_all` flips the flag before draining.  Either its drain sees
        // this entry or this load sees the flag.
        if self.inner.closed.load(Ordering::SeqCst) {
            self.resolve(id, Err(self.disconnected()));
        }

        tracing::trace!(peer = %self.inner.peer, call_id = id, kind = %kind, "call registered");
        (id, rx)
    }

    /// Resolve a pending call.
    ///
    /// Returns `true` if this resolution was the one delivered, `false` if
    /// the call was already resolved, forgotten or never existed.
    pub fn resolve(&self, id: CallId, result: Result<Value>) -> bool {
        let Some((_, call)) = self.inner.pending.remove(&id) else {
            tracing::trace!(peer = %self.inner.peer, call_id = id, "resolution for unknown call ignored");
            return false;
        };

        tracing::trace!(
            peer = %self.inner.peer,
            call_id = id,
            kind = %call.kind,
            ok = result.is_ok(),
            elapsed_ms = call.submitted_at.elapsed().as_millis() as u64,
            "call resolved"
        );

        // The waiter may have gone away; the entry is released either way.
        let _ = call.slot.send(result);
        true
    }

    /// Drop a pending call without resolving it (caller abandoned the wait).
    pub fn forget(&self, id: CallId) -> bool {
        self.inner.pending.remove(&id).is_some()
    }

    /// Resolve every outstanding call with `PeerDisconnected` and refuse new
    /// ones.  Returns the number of calls that were failed.
    pub fn fail_all(&self) -> usize {
        self.inner.closed.store(true, Ordering::SeqCst);

        let ids: Vec<CallId> = self.inner.pending.iter().map(|e| *e.key()).collect();
        let failed = ids
            .into_iter()
            .filter(|id| self.resolve(*id, Err(self.disconnected())))
            .count();

        if failed > 0 {
            tracing::debug!(peer = %self.inner.peer, failed, "outstanding calls failed on disconnect");
        }
        failed
    }

    /// Whether [`fail_all`](Self::fail_all) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Suspend until the call resolves or its deadline passes.
    ///
    /// A deadline resolves the call with `DeadlineExceeded` through the same
    /// single-write path, so a response racing the timer is either delivered
    /// in full or discarded, never both.
    pub async fn wait(
        &self,
        id: CallId,
        kind: CallKind,
        mut slot: ResultSlot,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let received = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, &mut slot).await {
                Ok(received) => received,
                Err(_) => {
                    self.resolve(
                        id,
                        Err(KernelError::DeadlineExceeded {
                            kind,
                            timeout_ms: timeout.as_millis() as u64,
                        }),
                    );
                    slot.await
                }
            },
            None => slot.await,
        };

        // A dropped sender without a value means the entry was forgotten.
        received.unwrap_or_else(|_| Err(self.disconnected()))
    }

    /// Number of calls currently in flight.
    pub fn outstanding(&self) -> usize {
        self.inner.pending.len()
    }

    fn disconnected(&self) -> KernelError {
        KernelError::PeerDisconnected {
            peer: self.inner.peer.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::ErrorCode;

    #[tokio::test]
    async fn response_resolves_waiter() {
        let c = Correlator::new("p1");
        let (id, slot) = c.register(CallKind::Configure);
        assert_eq!(c.outstanding(), 1);

        assert!(c.resolve(id, Ok(serde_json::json!({"events": 3}))));
        let value = c.wait(id, CallKind::Configure, slot, None).await.unwrap();
        assert_eq!(value["events"], 3);
        assert_eq!(c.outstanding(), 0);
    }

    #[tokio::test]
    async fn second_resolution_is_refused() {
        let c = Correlator::new("p1");
        let (id, slot) = c.register(CallKind::Synchronize);

        assert!(c.resolve(id, Ok(Value::Null)));
        assert!(!c.resolve(id, Err(KernelError::from_wire(ErrorCode::Internal, "late"))));
        assert!(c.wait(id, CallKind::Synchronize, slot, None).await.is_ok());
    }

    #[tokio::test]
    async fn deadline_fires_when_nobody_answers() {
        let c = Correlator::new("p1");
        let (id, slot) = c.register(CallKind::Configure);

        let err = c
            .wait(id, CallKind::Configure, slot, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::DeadlineExceeded { timeout_ms: 50, .. }));
        assert_eq!(c.outstanding(), 0);
        // A response arriving after the deadline finds nothing to resolve.
        assert!(!c.resolve(id, Ok(Value::Null)));
    }

    #[tokio::test]
    async fn fail_all_resolves_every_call() {
        let c = Correlator::new("p1");
        let calls: Vec<_> = (0..5)
            .map(|_| c.register(CallKind::UpdateContainer))
            .collect();

        assert_eq!(c.fail_all(), 5);
        for (id, slot) in calls {
            let err = c.wait(id, CallKind::UpdateContainer, slot, None).await.unwrap_err();
            assert!(matches!(err, KernelError::PeerDisconnected { .. }));
        }
    }

    #[tokio::test]
    async fn register_after_close_fails_immediately() {
        let c = Correlator::new("p1");
        c.fail_all();
        assert!(c.is_closed());

        let (id, slot) = c.register(CallKind::Shutdown);
        let err = c.wait(id, CallKind::Shutdown, slot, None).await.unwrap_err();
        assert!(matches!(err, KernelError::PeerDisconnected { .. }));
        assert_eq!(c.outstanding(), 0);
    }

    #[test]
    fn ids_are_monotonic() {
        let c = Correlator::new("p1");
        let (a, _ra) = c.register(CallKind::StateChange);
        let (b, _rb) = c.register(CallKind::StateChange);
        assert!(b > a);
    }

    #[test]
    fn forget_releases_without_resolving() {
        let c = Correlator::new("p1");
        let (id, _slot) = c.register(CallKind::StopContainer);
        assert!(c.forget(id));
        assert!(!c.forget(id));
        assert!(!c.resolve(id, Ok(Value::Null)));
        assert_eq!(c.outstanding(), 0);
    }
}
