//! Connection registry.
//!
//! The registry tracks every live peer connection known to the process,
//! keyed by caller-assigned identity: plugin ids on the NRI surface, or any
//! other peer name a caller chooses.  It owns the entries exclusively and
//! closes a peer's connection when the entry is removed, which fails every
//! call still outstanding on it.
//!
//! Internally the registry is backed by [`DashMap`], so registration of the
//! same id from many tasks is decided under a single shard lock: exactly one
//! caller wins.
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use extbridge_kernel::connection::{Connection, NoInbound};
//! # use extbridge_kernel::registry::{ConnectionRegistry, ConnectionState};
//! # async fn example(stream: tokio::io::DuplexStream) {
//! let registry = ConnectionRegistry::new();
//! let conn = Connection::open("p1", stream, Arc::new(NoInbound));
//! registry.register("p1", conn).unwrap();
//!
//! registry.set_state("p1", ConnectionState::Connected).unwrap();
//! assert!(registry.is_connected("p1"));
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::error::{KernelError, Result};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Lifecycle state of a registered peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// The connection is open but the peer's handshake has not completed.
    Connecting,
    /// The peer completed its handshake and is serving calls.
    Connected,
    /// The connection is gone; the entry is about to be removed.
    Disconnected,
}

/// Snapshot of a registered peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Caller-assigned peer identity.
    pub id: String,
    pub state: ConnectionState,
    /// When the peer entered the registry.
    pub registered_at: DateTime<Utc>,
    /// Identifier of the underlying [`Connection`].
    pub connection_id: u64,
    /// Outgoing calls not yet resolved.
    pub outstanding_calls: usize,
}

struct PeerEntry {
    connection: Connection,
    state: ConnectionState,
    registered_at: DateTime<Utc>,
}

impl PeerEntry {
    fn new(connection: Connection) -> Self {
        Self {
            connection,
            state: ConnectionState::Connecting,
            registered_at: Utc::now(),
        }
    }

    fn info(&self, id: &str) -> PeerInfo {
        let state = if self.connection.is_closed() {
            ConnectionState::Disconnected
        } else {
            self.state
        };
        PeerInfo {
            id: id.to_string(),
            state,
            registered_at: self.registered_at,
            connection_id: self.connection.id(),
            outstanding_calls: self.connection.outstanding_calls(),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Concurrent peer registry backed by [`DashMap`].
///
/// The registry is cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<DashMap<String, PeerEntry>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    /// Register `connection` under `id` in the `Connecting` state.
    ///
    /// Fails with `AlreadyExists` if a live connection holds the id.  An
    /// entry whose connection has already closed is replaced.
    pub fn register(&self, id: impl Into<String>, connection: Connection) -> Result<()> {
        let id = id.into();
        match self.inner.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                if !occupied.get().connection.is_closed() {
                    return Err(KernelError::AlreadyExists { id });
                }
                tracing::debug!(peer_id = %id, "replacing closed registry entry");
                occupied.insert(PeerEntry::new(connection));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(PeerEntry::new(connection));
            }
        }
        tracing::info!(peer_id = %id, "peer registered");
        Ok(())
    }

    /// Remove a peer and close its connection.
    ///
    /// Every call outstanding on the connection resolves with
    /// `PeerDisconnected` before this returns.
    pub fn unregister(&self, id: &str) -> Result<()> {
        let (_, entry) = self.inner.remove(id).ok_or_else(|| KernelError::NotFound {
            id: id.to_string(),
        })?;
        let outstanding = entry.connection.outstanding_calls();
        entry.connection.close();
        tracing::info!(peer_id = %id, outstanding, "peer unregistered");
        Ok(())
    }

    /// Remove `id` only if it still refers to connection `connection_id`.
    ///
    /// Used by closure monitors so a stale monitor never evicts a newer
    /// connection registered under the same id.
    pub fn remove_if(&self, id: &str, connection_id: u64) -> bool {
        let removed = self
            .inner
            .remove_if(id, |_, entry| entry.connection.id() == connection_id);
        match removed {
            Some((_, entry)) => {
                entry.connection.close();
                tracing::info!(peer_id = %id, connection_id, "closed peer removed");
                true
            }
            None => false,
        }
    }

    /// Look up the connection registered under `id`.
    pub fn lookup(&self, id: &str) -> Result<Connection> {
        self.inner
            .get(id)
            .map(|entry| entry.connection.clone())
            .ok_or_else(|| KernelError::NotFound { id: id.to_string() })
    }

    /// Update the lifecycle state of a registered peer.
    pub fn set_state(&self, id: &str, state: ConnectionState) -> Result<()> {
        let mut entry = self
            .inner
            .get_mut(id)
            .ok_or_else(|| KernelError::NotFound { id: id.to_string() })?;

        let old = entry.state;
        entry.state = state;

        tracing::debug!(peer_id = %id, old_state = ?old, new_state = ?state, "peer state changed");
        Ok(())
    }

    /// Current state of a registered peer.
    pub fn state(&self, id: &str) -> Result<ConnectionState> {
        self.info(id).map(|info| info.state)
    }

    /// Snapshot of one peer.
    pub fn info(&self, id: &str) -> Result<PeerInfo> {
        self.inner
            .get(id)
            .map(|entry| entry.info(id))
            .ok_or_else(|| KernelError::NotFound { id: id.to_string() })
    }

    /// All registered peer ids.
    pub fn list_ids(&self) -> Vec<String> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of all registered peers.
    pub fn list_all(&self) -> Vec<PeerInfo> {
        self.inner.iter().map(|e| e.value().info(e.key())).collect()
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    /// Whether `id` is registered, `Connected` and its connection still open.
    pub fn is_connected(&self, id: &str) -> bool {
        self.inner
            .get(id)
            .map(|e| e.state == ConnectionState::Connected && !e.connection.is_closed())
            .unwrap_or(false)
    }

    /// Remove every peer, closing each connection.  Returns the ids that
    /// were removed.
    pub fn clear(&self) -> Vec<String> {
        let mut removed: Vec<String> = self
            .list_ids()
            .into_iter()
            .filter(|id| self.unregister(id).is_ok())
            .collect();
        removed.sort();
        removed
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::NoInbound;

    fn connection(peer: &str) -> (Connection, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(1024);
        (Connection::open(peer, a, Arc::new(NoInbound)), b)
    }

    #[tokio::test]
    async fn register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let (conn, _far) = connection("p1");
        let conn_id = conn.id();
        registry.register("p1", conn).unwrap();

        let found = registry.lookup("p1").unwrap();
        assert_eq!(found.id(), conn_id);
        assert_eq!(registry.state("p1").unwrap(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn duplicate_register_is_refused() {
        let registry = ConnectionRegistry::new();
        let (a, _fa) = connection("p1");
        let (b, _fb) = connection("p1");
        registry.register("p1", a).unwrap();
        let err = registry.register("p1", b).unwrap_err();
        assert!(matches!(err, KernelError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn closed_entry_is_replaced() {
        let registry = ConnectionRegistry::new();
        let (a, _fa) = connection("p1");
        let (b, _fb) = connection("p1");
        let b_id = b.id();
        registry.register("p1", a.clone()).unwrap();
        a.close();
        registry.register("p1", b).unwrap();
        assert_eq!(registry.lookup("p1").unwrap().id(), b_id);
    }

    #[tokio::test]
    async fn unregister_twice_yields_not_found() {
        let registry = ConnectionRegistry::new();
        let (conn, _far) = connection("p1");
        registry.register("p1", conn.clone()).unwrap();

        registry.unregister("p1").unwrap();
        assert!(conn.is_closed());
        let err = registry.unregister("p1").unwrap_err();
        assert!(err.is_not_found());
        assert!(registry.lookup("p1").is_err());
    }

    #[tokio::test]
    async fn remove_if_checks_connection_identity() {
        let registry = ConnectionRegistry::new();
        let (conn, _far) = connection("p1");
        let id = conn.id();
        registry.register("p1", conn).unwrap();

        assert!(!registry.remove_if("p1", id + 1000));
        assert_eq!(registry.count(), 1);
        assert!(registry.remove_if("p1", id));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn state_transitions_and_listing() {
        let registry = ConnectionRegistry::new();
        let (a, _fa) = connection("a");
        let (b, _fb) = connection("b");
        registry.register("a", a).unwrap();
        registry.register("b", b).unwrap();

        registry.set_state("a", ConnectionState::Connected).unwrap();
        assert!(registry.is_connected("a"));
        assert!(!registry.is_connected("b"));
        assert!(!registry.is_connected("missing"));
        assert_eq!(registry.state("b").unwrap(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn clear_closes_everything() {
        let registry = ConnectionRegistry::new();
        let (a, _fa) = connection("a");
        let (b, _fb) = connection("b");
        registry.register("a", a.clone()).unwrap();
        registry.register("b", b.clone()).unwrap();

        assert_eq!(registry.clear(), vec!["a".to_string(), "b".to_string()]);
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert_eq!(registry.count(), 0);
    }
}
