//! Shared helper functions used across CLI subcommands.

use anyhow::Result;
use extbridge_kernel::Event;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::settings::{LogFormat, LogSettings};

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber.  `RUST_LOG` overrides the configured
/// level.
pub fn init_tracing(log: &LogSettings) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));

    match log.format {
        LogFormat::Compact => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Print `value` as pretty JSON on stdout.
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Log one bus event at a level matching its severity.
pub fn log_event(event: &Event) {
    match event {
        Event::PeerConnected {
            peer, connection_id, ..
        } => tracing::info!(plugin_id = %peer, connection_id, "plugin connected"),
        Event::PeerRegistered {
            peer, name, index, ..
        } => tracing::info!(plugin_id = %peer, name = %name, index = %index, "plugin registered"),
        Event::PeerRejected { peer, reason, .. } => {
            tracing::warn!(plugin_id = %peer, reason = %reason, "plugin rejected")
        }
        Event::PeerDisconnected { peer, reason, .. } => {
            tracing::info!(plugin_id = %peer, reason = %reason, "plugin disconnected")
        }
        Event::CallFailed {
            peer, kind, reason, ..
        } => tracing::warn!(plugin_id = %peer, kind = %kind, reason = %reason, "plugin call failed"),
        Event::SandboxWaitResolved {
            sandbox_id, outcome, ..
        } => tracing::info!(sandbox_id = %sandbox_id, outcome = %outcome, "sandbox wait resolved"),
    }
}
