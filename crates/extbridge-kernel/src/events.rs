//! Bridge event bus.
//!
//! A lightweight publish/subscribe channel built on
//! [`tokio::sync::broadcast`].  The plugin bridge and the sandbox controller
//! publish lifecycle [`Event`]s here so that embedding code can log, audit or
//! react to them without being on the call path.
//!
//! Events are wrapped in [`Arc`] so broadcasting to many subscribers never
//! clones the payload.  Publishing with nobody listening is not an error.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use extbridge_kernel::events::{EventBus, Event};
//! # async fn example() {
//! let bus = EventBus::new(256);
//! let mut rx = bus.subscribe();
//!
//! bus.publish(Event::PeerDisconnected {
//!     peer: "plugin-a".into(),
//!     reason: "disconnect".into(),
//!     timestamp: chrono::Utc::now(),
//! });
//!
//! let event = rx.recv().await.unwrap();
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::frame::CallKind;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A lifecycle event published by a bridge surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// A peer connection was opened and entered the registry.
    PeerConnected {
        peer: String,
        connection_id: u64,
        timestamp: DateTime<Utc>,
    },

    /// A plugin completed registration and was accepted.
    PeerRegistered {
        peer: String,
        /// Plugin name from the registration request.
        name: String,
        /// Plugin index (ordering key) from the registration request.
        index: String,
        timestamp: DateTime<Utc>,
    },

    /// The runtime's policy refused a plugin's registration.
    PeerRejected {
        peer: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A peer left the registry.
    PeerDisconnected {
        peer: String,
        /// Why the peer went away (e.g. "disconnect", "connection closed").
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// An outgoing call failed.
    CallFailed {
        peer: String,
        kind: CallKind,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A sandbox wait produced its classified outcome.
    SandboxWaitResolved {
        sandbox_id: String,
        /// "ready", "pending" or "exited".
        outcome: String,
        timestamp: DateTime<Utc>,
    },
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

/// Publish/subscribe event bus backed by [`tokio::sync::broadcast`].
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

struct EventBusInner {
    sender: broadcast::Sender<Arc<Event>>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// A subscriber that falls more than `capacity` events behind receives
    /// [`broadcast::error::RecvError::Lagged`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(EventBusInner { sender }),
        }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of receivers that will observe it.
    pub fn publish(&self, event: Event) -> usize {
        match self.inner.sender.send(Arc::new(event)) {
            Ok(n) => {
                tracing::trace!(receivers = n, "event published");
                n
            }
            Err(_) => 0,
        }
    }

    /// Subscribe to all future events.  Past events are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Event>> {
        self.inner.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        let receivers = bus.publish(Event::PeerDisconnected {
            peer: "p1".into(),
            reason: "disconnect".into(),
            timestamp: Utc::now(),
        });
        assert_eq!(receivers, 1);

        let received = rx.recv().await.expect("should receive event");
        match received.as_ref() {
            Event::PeerDisconnected { peer, reason, .. } => {
                assert_eq!(peer, "p1");
                assert_eq!(reason, "disconnect");
            }
            other => panic!("unexpected event variant: {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribers_share_one_allocation() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(Event::SandboxWaitResolved {
            sandbox_id: "sb1".into(),
            outcome: "ready".into(),
            timestamp: Utc::now(),
        });

        let e1 = rx1.recv().await.expect("rx1");
        let e2 = rx2.recv().await.expect("rx2");
        assert!(Arc::ptr_eq(&e1, &e2));
    }

    #[test]
    fn publish_without_subscribers_returns_zero() {
        let bus = EventBus::new(16);
        let n = bus.publish(Event::CallFailed {
            peer: "p2".into(),
            kind: CallKind::Configure,
            reason: "deadline exceeded".into(),
            timestamp: Utc::now(),
        });
        assert_eq!(n, 0);
    }
}
