//! extbridge plugin bridge.
//!
//! Lets out-of-process plugins observe and adjust container lifecycle
//! decisions.  The runtime drives plugins through a [`PluginBridge`]; plugins
//! call back into the runtime through a [`RuntimeHandler`] supplied once at
//! construction.
//!
//! - **[`bridge`]** -- Plugin registry, registration handshake and the
//!   runtime-to-plugin calls.
//! - **[`handler`]** -- Runtime policy trait for plugin-initiated calls.
//! - **[`listener`]** -- Accept loop for externally started plugins.
//! - **[`types`]** -- NRI message records.
//! - **[`config`]** -- Deadlines and limits.
//! - **[`error`]** -- [`NriError`].

pub mod bridge;
pub mod config;
pub mod error;
pub mod handler;
pub mod listener;
pub mod types;

pub use bridge::{PluginBridge, PluginInfo};
pub use config::BridgeConfig;
pub use error::{NriError, Result};
pub use handler::{RegistrationDecision, RuntimeHandler};
pub use listener::{ExternalConnectHandler, ExternalListener};
