//! The plugin bridge.
//!
//! [`PluginBridge`] composes the kernel's [`ConnectionRegistry`] and
//! per-connection correlator into the runtime's view of its plugins:
//!
//! - `connect` adopts a plugin's stream, waits for the plugin to register,
//!   and lets the [`RuntimeHandler`] accept or reject it.
//! - `configure`, `synchronize`, `create_container`, `update_container`,
//!   `stop_container`, `state_change` and `shutdown` push lifecycle calls to
//!   one plugin and return its typed answer.
//! - `disconnect` and `destroy` tear connections down, failing whatever was
//!   still in flight on them.
//!
//! Every plugin has its own connection, so a hung or vanished plugin only
//! ever fails its own calls.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use extbridge_kernel::{
    CallKind, Connection, ConnectionRegistry, ConnectionState, Event, EventBus, KernelError,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

use crate::config::BridgeConfig;
use crate::error::{NriError, Result};
use crate::handler::{Handshake, PluginService, RuntimeHandler};
use crate::listener::{ExternalConnectHandler, ExternalListener};
use crate::types::{
    ConfigureRequest, ConfigureResponse, CreateContainerRequest, CreateContainerResponse, Empty,
    StateChangeEvent, StopContainerRequest, StopContainerResponse, SynchronizeRequest,
    SynchronizeResponse, UpdateContainerRequest, UpdateContainerResponse,
};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Snapshot of a connected plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub id: String,
    /// Name the plugin registered with (empty until registration).
    pub name: String,
    /// Ordering index the plugin registered with.
    pub index: String,
    pub state: ConnectionState,
    pub connection_id: u64,
    pub connected_at: DateTime<Utc>,
    /// Per-call deadline applied to this plugin.
    pub call_timeout_ms: u64,
    pub outstanding_calls: usize,
}

#[derive(Debug)]
struct PluginMeta {
    connection_id: u64,
    name: String,
    index: String,
    call_timeout: Duration,
    connected_at: DateTime<Utc>,
    /// One of `max_plugins` slots, released when the entry is removed.
    _slot: OwnedSemaphorePermit,
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// Runtime-side endpoint for all plugin connections.
///
/// Cheaply cloneable; all clones share the same registry.
#[derive(Clone)]
pub struct PluginBridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    registry: ConnectionRegistry,
    handler: Arc<dyn RuntimeHandler>,
    config: BridgeConfig,
    events: EventBus,
    plugins: DashMap<String, PluginMeta>,
    slots: Arc<Semaphore>,
    external: Mutex<Option<ExternalListener>>,
}

impl PluginBridge {
    /// Build a bridge whose plugin-initiated calls are decided by `handler`.
    pub fn new(handler: Arc<dyn RuntimeHandler>, config: BridgeConfig) -> Self {
        Self::with_events(handler, config, EventBus::default())
    }

    /// Like [`new`](Self::new), publishing lifecycle events to `events`.
    pub fn with_events(handler: Arc<dyn RuntimeHandler>, config: BridgeConfig, events: EventBus) -> Self {
        tracing::info!(
            max_plugins = config.max_plugins,
            default_call_timeout_ms = config.default_call_timeout.as_millis() as u64,
            "plugin bridge initialized"
        );
        let slots = Arc::new(Semaphore::new(config.max_plugins.min(Semaphore::MAX_PERMITS)));
        Self {
            inner: Arc::new(BridgeInner {
                registry: ConnectionRegistry::new(),
                handler,
                config,
                events,
                plugins: DashMap::new(),
                slots,
                external: Mutex::new(None),
            }),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    // -- Connection lifecycle ------------------------------------------------

    /// Adopt `stream` as the connection of `plugin_id` and complete the
    /// registration handshake.
    ///
    /// The plugin must call `register_plugin` within `timeout`; the same
    /// value becomes the plugin's per-call deadline.  A zero timeout selects
    /// the configured default.  On any failure the stream is closed and no
    /// registry entry is left behind.
    pub async fn connect<S>(&self, plugin_id: impl Into<String>, stream: S, timeout: Duration) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let plugin_id = plugin_id.into();
        let timeout = if timeout.is_zero() {
            self.inner.config.default_call_timeout
        } else {
            timeout
        };

        if self.inner.registry.lookup(&plugin_id).is_ok_and(|c| !c.is_closed()) {
            return Err(NriError::AlreadyConnected { plugin_id });
        }
        // Concurrent connects race for the slot, not for a registry count.
        let slot = self
            .inner
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| NriError::LimitReached {
                limit: self.inner.config.max_plugins,
            })?;

        let (service, handshake) = PluginService::new(plugin_id.clone(), self.inner.handler.clone());
        let conn = Connection::open(plugin_id.clone(), stream, Arc::new(service));
        let conn_id = conn.id();

        if let Err(e) = self.inner.registry.register(plugin_id.clone(), conn.clone()) {
            conn.close();
            return Err(match e {
                KernelError::AlreadyExists { .. } => NriError::AlreadyConnected { plugin_id },
                other => other.into(),
            });
        }

        self.inner.plugins.insert(
            plugin_id.clone(),
            PluginMeta {
                connection_id: conn_id,
                name: String::new(),
                index: String::new(),
                call_timeout: timeout,
                connected_at: Utc::now(),
                _slot: slot,
            },
        );
        self.spawn_monitor(&plugin_id, &conn);
        self.inner.events.publish(Event::PeerConnected {
            peer: plugin_id.clone(),
            connection_id: conn_id,
            timestamp: Utc::now(),
        });
        tracing::info!(plugin_id = %plugin_id, connection_id = conn_id, "plugin connected, awaiting registration");

        let outcome = tokio::time::timeout(timeout, handshake).await;
        match outcome {
            Ok(Ok(Handshake::Accepted(request))) => {
                if let Some(mut meta) = self.inner.plugins.get_mut(&plugin_id) {
                    meta.name = request.plugin_name.clone();
                    meta.index = request.plugin_idx.clone();
                }
                self.inner.registry.set_state(&plugin_id, ConnectionState::Connected)?;
                self.inner.events.publish(Event::PeerRegistered {
                    peer: plugin_id.clone(),
                    name: request.plugin_name.clone(),
                    index: request.plugin_idx.clone(),
                    timestamp: Utc::now(),
                });
                tracing::info!(
                    plugin_id = %plugin_id,
                    plugin_name = %request.plugin_name,
                    plugin_idx = %request.plugin_idx,
                    "plugin registered"
                );
                Ok(())
            }
            Ok(Ok(Handshake::Rejected(reason))) => {
                self.evict(&plugin_id, conn_id);
                self.inner.events.publish(Event::PeerRejected {
                    peer: plugin_id.clone(),
                    reason: reason.clone(),
                    timestamp: Utc::now(),
                });
                Err(NriError::PolicyRejected { plugin_id, reason })
            }
            Ok(Err(_)) => {
                // The connection closed before the plugin registered.
                self.evict(&plugin_id, conn_id);
                Err(KernelError::PeerDisconnected { peer: plugin_id }.into())
            }
            Err(_) => {
                tracing::warn!(
                    plugin_id = %plugin_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "plugin registration timed out"
                );
                self.evict(&plugin_id, conn_id);
                Err(NriError::HandshakeTimeout {
                    plugin_id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Adopt a raw Unix socket descriptor as the connection of `plugin_id`.
    ///
    /// The descriptor is owned from here on and closed on every failure path.
    #[cfg(unix)]
    pub async fn connect_fd(
        &self,
        plugin_id: impl Into<String>,
        fd: std::os::fd::OwnedFd,
        timeout: Duration,
    ) -> Result<()> {
        let stream = std::os::unix::net::UnixStream::from(fd);
        stream.set_nonblocking(true)?;
        let stream = tokio::net::UnixStream::from_std(stream)?;
        self.connect(plugin_id, stream, timeout).await
    }

    /// Tear down a plugin's connection.
    ///
    /// Every call still outstanding on it resolves with `PeerDisconnected`.
    /// A second call for the same id yields `NotFound`.
    pub fn disconnect(&self, plugin_id: &str) -> Result<()> {
        self.inner.registry.unregister(plugin_id).map_err(|e| match e {
            KernelError::NotFound { .. } => NriError::NotFound {
                plugin_id: plugin_id.to_string(),
            },
            other => other.into(),
        })?;
        self.inner.plugins.remove(plugin_id);
        self.inner.events.publish(Event::PeerDisconnected {
            peer: plugin_id.to_string(),
            reason: "disconnect".into(),
            timestamp: Utc::now(),
        });
        tracing::info!(plugin_id = %plugin_id, "plugin disconnected");
        Ok(())
    }

    /// Disconnect every plugin and stop the external listener, if any.
    /// Returns the number of plugins disconnected.
    pub async fn destroy(&self) -> usize {
        self.shutdown_external().await;
        let removed = self.inner.registry.clear();
        for plugin_id in &removed {
            self.inner.plugins.remove(plugin_id);
            self.inner.events.publish(Event::PeerDisconnected {
                peer: plugin_id.clone(),
                reason: "destroy".into(),
                timestamp: Utc::now(),
            });
        }
        tracing::info!(disconnected = removed.len(), "plugin bridge destroyed");
        removed.len()
    }

    /// Snapshot of every connected plugin, ordered by plugin index then id.
    pub fn plugins(&self) -> Vec<PluginInfo> {
        let mut plugins: Vec<PluginInfo> = self
            .inner
            .registry
            .list_all()
            .into_iter()
            .filter_map(|peer| {
                let meta = self.inner.plugins.get(&peer.id)?;
                Some(PluginInfo {
                    name: meta.name.clone(),
                    index: meta.index.clone(),
                    call_timeout_ms: meta.call_timeout.as_millis() as u64,
                    connected_at: meta.connected_at,
                    id: peer.id,
                    state: peer.state,
                    connection_id: peer.connection_id,
                    outstanding_calls: peer.outstanding_calls,
                })
            })
            .collect();
        plugins.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.id.cmp(&b.id)));
        plugins
    }

    pub fn is_connected(&self, plugin_id: &str) -> bool {
        self.inner.registry.is_connected(plugin_id)
    }

    // -- Runtime -> plugin calls --------------------------------------------

    pub async fn configure(&self, plugin_id: &str, request: &ConfigureRequest) -> Result<ConfigureResponse> {
        self.call(plugin_id, CallKind::Configure, request).await
    }

    pub async fn synchronize(&self, plugin_id: &str, request: &SynchronizeRequest) -> Result<SynchronizeResponse> {
        self.call(plugin_id, CallKind::Synchronize, request).await
    }

    pub async fn create_container(
        &self,
        plugin_id: &str,
        request: &CreateContainerRequest,
    ) -> Result<CreateContainerResponse> {
        self.call(plugin_id, CallKind::CreateContainer, request).await
    }

    pub async fn update_container(
        &self,
        plugin_id: &str,
        request: &UpdateContainerRequest,
    ) -> Result<UpdateContainerResponse> {
        self.call(plugin_id, CallKind::UpdateContainer, request).await
    }

    pub async fn stop_container(
        &self,
        plugin_id: &str,
        request: &StopContainerRequest,
    ) -> Result<StopContainerResponse> {
        self.call(plugin_id, CallKind::StopContainer, request).await
    }

    /// Notify a plugin of a lifecycle event.  The plugin must acknowledge;
    /// the acknowledgement carries no body.
    pub async fn state_change(&self, plugin_id: &str, event: &StateChangeEvent) -> Result<()> {
        let _: Empty = self.call(plugin_id, CallKind::StateChange, event).await?;
        Ok(())
    }

    /// Ask a plugin to shut down, then disconnect it.
    ///
    /// The plugin gets the configured grace period to acknowledge.  The
    /// disconnect happens whether or not it does; a missing acknowledgement
    /// is logged, not returned.
    pub async fn shutdown(&self, plugin_id: &str) -> Result<()> {
        let conn = self.lookup(plugin_id)?;
        let grace = self.inner.config.shutdown_grace;

        let ack = conn
            .call_typed::<Empty, Empty>(CallKind::Shutdown, &Empty {}, Some(grace))
            .await;
        if let Err(e) = ack {
            tracing::debug!(plugin_id = %plugin_id, error = %e, "plugin did not acknowledge shutdown");
        }

        match self.disconnect(plugin_id) {
            // The plugin may already have hung up after acknowledging.
            Err(NriError::NotFound { .. }) => Ok(()),
            other => other,
        }
    }

    // -- External listener ---------------------------------------------------

    /// Start accepting plugin connections on `socket_path`.
    ///
    /// Fails with `AlreadyStarted` while a listener is running.
    pub async fn start_external(
        &self,
        socket_path: impl AsRef<std::path::Path>,
        handler: Arc<dyn ExternalConnectHandler>,
    ) -> Result<()> {
        let mut slot = self.inner.external.lock().await;
        if slot.is_some() {
            return Err(NriError::AlreadyStarted);
        }
        *slot = Some(ExternalListener::start(socket_path, handler)?);
        Ok(())
    }

    /// Stop the external listener.  A no-op when none is running.
    pub async fn shutdown_external(&self) {
        let listener = self.inner.external.lock().await.take();
        if let Some(listener) = listener {
            listener.shutdown().await;
        }
    }

    // -- Internals ------------------------------------------------------------

    fn lookup(&self, plugin_id: &str) -> Result<Connection> {
        self.inner.registry.lookup(plugin_id).map_err(|_| NriError::NotFound {
            plugin_id: plugin_id.to_string(),
        })
    }

    fn call_timeout(&self, plugin_id: &str) -> Duration {
        self.inner
            .plugins
            .get(plugin_id)
            .map(|meta| meta.call_timeout)
            .unwrap_or(self.inner.config.default_call_timeout)
    }

    async fn call<Req, Resp>(&self, plugin_id: &str, kind: CallKind, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let conn = self.lookup(plugin_id)?;
        let timeout = self.call_timeout(plugin_id);

        tracing::debug!(plugin_id = %plugin_id, kind = %kind, "calling plugin");
        match conn.call_typed(kind, request, Some(timeout)).await {
            Ok(response) => Ok(response),
            Err(e) => {
                tracing::warn!(plugin_id = %plugin_id, kind = %kind, error = %e, "plugin call failed");
                self.inner.events.publish(Event::CallFailed {
                    peer: plugin_id.to_string(),
                    kind,
                    reason: e.to_string(),
                    timestamp: Utc::now(),
                });
                Err(e.into())
            }
        }
    }

    /// Remove `plugin_id` if it still refers to `connection_id`.
    fn evict(&self, plugin_id: &str, connection_id: u64) {
        self.inner
            .plugins
            .remove_if(plugin_id, |_, meta| meta.connection_id == connection_id);
        self.inner.registry.remove_if(plugin_id, connection_id);
    }

    /// Drop the registry entry when the connection closes on its own.
    fn spawn_monitor(&self, plugin_id: &str, conn: &Connection) {
        let signal = conn.close_signal();
        let connection_id = conn.id();
        let plugin_id = plugin_id.to_string();
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            signal.wait().await;
            let Some(inner) = weak.upgrade() else { return };
            // Metadata goes first so its slot is free once the plugin is no
            // longer listed.
            inner
                .plugins
                .remove_if(&plugin_id, |_, meta| meta.connection_id == connection_id);
            if inner.registry.remove_if(&plugin_id, connection_id) {
                inner.events.publish(Event::PeerDisconnected {
                    peer: plugin_id.clone(),
                    reason: "connection closed".into(),
                    timestamp: Utc::now(),
                });
                tracing::info!(plugin_id = %plugin_id, connection_id, "plugin connection closed");
            }
        });
    }
}
