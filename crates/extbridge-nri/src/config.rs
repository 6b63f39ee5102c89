//! Plugin bridge configuration.
//!
//! [`BridgeConfig`] carries the deadlines and limits the bridge applies to
//! every plugin.  Defaults come from [`Default`]; the builder-style `with_*`
//! methods adjust individual fields.

use std::time::Duration;

/// Deadlines and limits for the plugin bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Per-call deadline used when a plugin connected without an explicit
    /// timeout.
    ///
    /// Default: **2 s**.
    pub default_call_timeout: Duration,

    /// How long `shutdown` waits for the plugin to acknowledge before the
    /// bridge disconnects it anyway.
    ///
    /// Default: **1 s**.
    pub shutdown_grace: Duration,

    /// Maximum number of plugins connected at once.
    ///
    /// Default: **64**.
    pub max_plugins: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_call_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(1),
            max_plugins: 64,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fallback per-call deadline.
    pub fn with_default_call_timeout(mut self, timeout: Duration) -> Self {
        self.default_call_timeout = timeout;
        self
    }

    /// Set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the plugin limit.
    pub fn with_max_plugins(mut self, max: usize) -> Self {
        self.max_plugins = max;
        self
    }
}
