//! Sandbox lifecycle as observed from outside.
//!
//! The sandboxer owns the state machine
//! `created -> running -> stopping -> exited`, and may reclaim a sandbox at
//! any point, after which it is `not found`.  The controller never caches
//! any of this; a [`SandboxState`] is always the answer to one fresh status
//! round-trip.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One observation of a sandbox's state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Created,
    /// Started and ready to run containers.
    Running,
    Stopping,
    Exited,
    /// The sandboxer has no record of the sandbox.
    NotFound,
    /// A state string this controller does not recognise.
    Unknown(String),
}

impl SandboxState {
    /// Classify a sandboxer state string.
    ///
    /// Accepts the lower-case names as well as the CRI-style
    /// `SANDBOX_READY` / `SANDBOX_NOTREADY`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "ready" | "running" | "started" | "sandbox_ready" => Self::Running,
            "stopping" => Self::Stopping,
            "exited" | "stopped" | "sandbox_notready" => Self::Exited,
            _ => Self::Unknown(raw.to_string()),
        }
    }

    /// `true` when the sandbox can make forward progress (a waiter should
    /// resume).
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Created | Self::Running)
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => f.write_str("created"),
            Self::Running => f.write_str("running"),
            Self::Stopping => f.write_str("stopping"),
            Self::Exited => f.write_str("exited"),
            Self::NotFound => f.write_str("not_found"),
            Self::Unknown(raw) => write!(f, "unknown({raw})"),
        }
    }
}
