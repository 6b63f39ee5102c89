//! Wait notifier.
//!
//! Waiting on a remote sandbox resolves into one of three continuations:
//! resume forward progress ([`WaitOutcome::Ready`]), poll again later
//! ([`WaitOutcome::Pending`]), or reap and report an exit
//! ([`WaitOutcome::Exited`]).  A [`WaitSubscription`] carries the caller's
//! three callbacks and its context, and is consumed by the single
//! [`fire`](WaitSubscription::fire) that delivers the outcome.

use serde::Serialize;

use crate::types::WaitResponse;

/// The classified result of one wait.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WaitOutcome {
    /// The sandbox is created or running; the caller may proceed.
    Ready,
    /// The sandbox's state could not be determined; wait again later.
    Pending { reason: String },
    /// The sandbox exited (or is gone).
    Exited(WaitResponse),
}

impl WaitOutcome {
    /// Short label, also used in published events.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Pending { .. } => "pending",
            Self::Exited(_) => "exited",
        }
    }
}

type ReadyFn<C> = Box<dyn FnOnce(C) + Send>;
type PendingFn<C> = Box<dyn FnOnce(C) + Send>;
type ExitFn<C> = Box<dyn FnOnce(C, &WaitResponse) + Send>;

/// The caller's continuation for each outcome.
pub struct WaitCallbacks<C> {
    ready: ReadyFn<C>,
    pending: PendingFn<C>,
    exit: ExitFn<C>,
}

impl<C> WaitCallbacks<C> {
    pub fn new(
        ready: impl FnOnce(C) + Send + 'static,
        pending: impl FnOnce(C) + Send + 'static,
        exit: impl FnOnce(C, &WaitResponse) + Send + 'static,
    ) -> Self {
        Self {
            ready: Box::new(ready),
            pending: Box::new(pending),
            exit: Box::new(exit),
        }
    }

    /// Callbacks that do nothing; the caller only uses the returned outcome.
    pub fn noop() -> Self {
        Self::new(|_| {}, |_| {}, |_, _| {})
    }
}

impl<C> std::fmt::Debug for WaitCallbacks<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitCallbacks").finish_non_exhaustive()
    }
}

/// One caller's interest in a sandbox's next transition.
///
/// Firing consumes the subscription, so at most one callback ever runs.
pub struct WaitSubscription<C> {
    sandbox_id: String,
    callbacks: WaitCallbacks<C>,
    context: C,
}

impl<C> WaitSubscription<C> {
    pub fn new(sandbox_id: impl Into<String>, callbacks: WaitCallbacks<C>, context: C) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            callbacks,
            context,
        }
    }

    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    /// Deliver `outcome` to exactly one callback.
    pub fn fire(self, outcome: &WaitOutcome) {
        tracing::debug!(sandbox_id = %self.sandbox_id, outcome = outcome.label(), "wait resolved");
        let Self {
            callbacks, context, ..
        } = self;
        match outcome {
            WaitOutcome::Ready => (callbacks.ready)(context),
            WaitOutcome::Pending { .. } => (callbacks.pending)(context),
            WaitOutcome::Exited(response) => (callbacks.exit)(context, response),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Bit 0 = ready, bit 1 = pending, bit 2 = exit.
    fn recording() -> (WaitCallbacks<Arc<AtomicU32>>, Arc<AtomicU32>) {
        let fired = Arc::new(AtomicU32::new(0));
        let callbacks = WaitCallbacks::new(
            |c: Arc<AtomicU32>| {
                c.fetch_or(1, Ordering::SeqCst);
            },
            |c: Arc<AtomicU32>| {
                c.fetch_or(2, Ordering::SeqCst);
            },
            |c: Arc<AtomicU32>, resp: &WaitResponse| {
                assert_eq!(resp.exit_status, 137);
                c.fetch_or(4, Ordering::SeqCst);
            },
        );
        (callbacks, fired)
    }

    #[test]
    fn each_outcome_fires_its_own_callback() {
        let cases = [
            (WaitOutcome::Ready, 1),
            (
                WaitOutcome::Pending {
                    reason: "status unavailable".into(),
                },
                2,
            ),
            (
                WaitOutcome::Exited(WaitResponse {
                    sandbox_id: "sb1".into(),
                    exit_status: 137,
                    exited_at: None,
                }),
                4,
            ),
        ];

        for (outcome, bit) in cases {
            let (callbacks, fired) = recording();
            WaitSubscription::new("sb1", callbacks, fired.clone()).fire(&outcome);
            assert_eq!(fired.load(Ordering::SeqCst), bit, "outcome {}", outcome.label());
        }
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let json = serde_json::to_value(WaitOutcome::Pending {
            reason: "x".into(),
        })
        .unwrap();
        assert_eq!(json["outcome"], "pending");
        assert_eq!(json["reason"], "x");

        let json = serde_json::to_value(WaitOutcome::Exited(WaitResponse::unknown_exit("sb1"))).unwrap();
        assert_eq!(json["outcome"], "exited");
        assert_eq!(json["exit_status"], 255);
    }
}
