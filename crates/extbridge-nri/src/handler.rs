//! Runtime-side handling of plugin-initiated calls.
//!
//! A plugin may call back into the runtime on its connection: once to
//! register itself, and any number of times to request bulk container
//! updates.  The runtime supplies a [`RuntimeHandler`] once, at bridge
//! construction, and every plugin connection dispatches through it.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use extbridge_kernel::{CallKind, InboundHandler, KernelError};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{NriError, Result};
use crate::types::{Empty, RegisterPluginRequest, UpdateContainersRequest, UpdateContainersResponse};

// ---------------------------------------------------------------------------
// Runtime handler
// ---------------------------------------------------------------------------

/// The runtime's verdict on a plugin registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationDecision {
    Accept,
    Reject { reason: String },
}

/// Runtime policy for calls a plugin makes into the runtime.
#[async_trait]
pub trait RuntimeHandler: Send + Sync + 'static {
    /// Decide whether `plugin_id` may register.
    async fn register_plugin(&self, plugin_id: &str, request: &RegisterPluginRequest) -> RegistrationDecision;

    /// Validate and apply a plugin's bulk container update.
    ///
    /// Updates that could not be applied are listed in the response's
    /// `failed` set; an `Err` fails the whole request.
    async fn update_containers(
        &self,
        plugin_id: &str,
        request: UpdateContainersRequest,
    ) -> Result<UpdateContainersResponse>;
}

// ---------------------------------------------------------------------------
// Per-plugin inbound service
// ---------------------------------------------------------------------------

/// Outcome of a plugin's registration call, as seen by `connect`.
#[derive(Debug)]
pub(crate) enum Handshake {
    Accepted(RegisterPluginRequest),
    Rejected(String),
}

/// Serves one plugin connection's inbound calls.
pub(crate) struct PluginService {
    plugin_id: String,
    handler: Arc<dyn RuntimeHandler>,
    /// Taken by the first registration; `None` afterwards.
    handshake: Mutex<Option<oneshot::Sender<Handshake>>>,
}

impl PluginService {
    pub(crate) fn new(
        plugin_id: String,
        handler: Arc<dyn RuntimeHandler>,
    ) -> (Self, oneshot::Receiver<Handshake>) {
        let (tx, rx) = oneshot::channel();
        let service = Self {
            plugin_id,
            handler,
            handshake: Mutex::new(Some(tx)),
        };
        (service, rx)
    }

    fn take_handshake(&self) -> Option<oneshot::Sender<Handshake>> {
        self.handshake.lock().ok().and_then(|mut slot| slot.take())
    }

    fn is_registered(&self) -> bool {
        self.handshake.lock().map(|slot| slot.is_none()).unwrap_or(false)
    }

    async fn register(&self, request: RegisterPluginRequest) -> extbridge_kernel::Result<Value> {
        let Some(handshake) = self.take_handshake() else {
            return Err(KernelError::AlreadyExists {
                id: self.plugin_id.clone(),
            });
        };

        tracing::info!(
            plugin_id = %self.plugin_id,
            plugin_name = %request.plugin_name,
            plugin_idx = %request.plugin_idx,
            "plugin registering"
        );

        match self.handler.register_plugin(&self.plugin_id, &request).await {
            RegistrationDecision::Accept => {
                let _ = handshake.send(Handshake::Accepted(request));
                Ok(serde_json::to_value(Empty {})?)
            }
            RegistrationDecision::Reject { reason } => {
                tracing::warn!(plugin_id = %self.plugin_id, reason = %reason, "plugin registration rejected");
                let _ = handshake.send(Handshake::Rejected(reason.clone()));
                Err(KernelError::PolicyRejected { reason })
            }
        }
    }

    async fn update_containers(&self, request: UpdateContainersRequest) -> extbridge_kernel::Result<Value> {
        if !self.is_registered() {
            return Err(KernelError::PolicyRejected {
                reason: format!("plugin {} is not registered", self.plugin_id),
            });
        }

        tracing::debug!(
            plugin_id = %self.plugin_id,
            updates = request.update.len(),
            evictions = request.evict.len(),
            "plugin requested container updates"
        );

        let response = self
            .handler
            .update_containers(&self.plugin_id, request)
            .await
            .map_err(into_wire_error)?;
        Ok(serde_json::to_value(response)?)
    }
}

#[async_trait]
impl InboundHandler for PluginService {
    async fn handle(&self, kind: CallKind, payload: Value) -> extbridge_kernel::Result<Value> {
        match kind {
            CallKind::RegisterPlugin => self.register(serde_json::from_value(payload)?).await,
            CallKind::UpdateContainers => self.update_containers(serde_json::from_value(payload)?).await,
            other => Err(KernelError::PolicyRejected {
                reason: format!("method {other} is not served by the runtime"),
            }),
        }
    }
}

/// Map a handler failure onto the kernel taxonomy for the error frame.
fn into_wire_error(err: NriError) -> KernelError {
    match err {
        NriError::Call(inner) => inner,
        NriError::PolicyRejected { reason, .. } => KernelError::PolicyRejected { reason },
        NriError::NotFound { plugin_id } => KernelError::NotFound { id: plugin_id },
        other => KernelError::Internal(other.to_string()),
    }
}
