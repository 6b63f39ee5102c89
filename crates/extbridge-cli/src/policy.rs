//! Registration policy and external connection intake for `serve`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use extbridge_nri::types::{RegisterPluginRequest, UpdateContainersRequest, UpdateContainersResponse};
use extbridge_nri::{ExternalConnectHandler, PluginBridge, RegistrationDecision, RuntimeHandler};
use tokio::net::UnixStream;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// PolicyHandler
// ---------------------------------------------------------------------------

/// Accepts plugins by name.
///
/// The standalone service manages no containers, so every update a plugin
/// requests is reported back as failed.
#[derive(Debug, Default)]
pub struct PolicyHandler {
    allowed: HashSet<String>,
}

impl PolicyHandler {
    /// An empty list allows every plugin.
    pub fn new(allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }

    fn permits(&self, name: &str) -> bool {
        self.allowed.is_empty() || self.allowed.contains(name)
    }
}

#[async_trait]
impl RuntimeHandler for PolicyHandler {
    async fn register_plugin(&self, plugin_id: &str, request: &RegisterPluginRequest) -> RegistrationDecision {
        if self.permits(&request.plugin_name) {
            tracing::debug!(plugin_id = %plugin_id, name = %request.plugin_name, "plugin permitted");
            RegistrationDecision::Accept
        } else {
            RegistrationDecision::Reject {
                reason: format!("plugin {} is not in the allowed list", request.plugin_name),
            }
        }
    }

    async fn update_containers(
        &self,
        plugin_id: &str,
        request: UpdateContainersRequest,
    ) -> extbridge_nri::Result<UpdateContainersResponse> {
        tracing::info!(
            plugin_id = %plugin_id,
            updates = request.update.len(),
            evictions = request.evict.len(),
            "unsolicited container update refused"
        );
        Ok(UpdateContainersResponse {
            failed: request.update,
        })
    }
}

// ---------------------------------------------------------------------------
// ExternalIntake
// ---------------------------------------------------------------------------

/// Hands each externally accepted stream to the bridge under a fresh id.
pub struct ExternalIntake {
    bridge: PluginBridge,
    timeout: Duration,
}

impl ExternalIntake {
    pub fn new(bridge: PluginBridge, timeout: Duration) -> Arc<Self> {
        Arc::new(Self { bridge, timeout })
    }
}

#[async_trait]
impl ExternalConnectHandler for ExternalIntake {
    async fn on_connect(&self, stream: UnixStream) -> extbridge_nri::Result<()> {
        let plugin_id = format!("external-{}", Uuid::now_v7());
        let result = self.bridge.connect(plugin_id.clone(), stream, self.timeout).await;
        if let Err(e) = &result {
            tracing::warn!(plugin_id = %plugin_id, error = %e, "external plugin not admitted");
        }
        result
    }
}
