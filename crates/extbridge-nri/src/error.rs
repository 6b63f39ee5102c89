//! Plugin bridge error types.
//!
//! Failures of a correlated call surface unchanged as [`NriError::Call`], so a
//! caller can still tell a deadline from a disconnect from a remote error.
//! Failures decided by the bridge itself get their own variants.

use extbridge_kernel::KernelError;

/// Unified error type for the plugin bridge.
#[derive(Debug, thiserror::Error)]
pub enum NriError {
    /// A live connection already exists for this plugin id.
    #[error("plugin already connected: {plugin_id}")]
    AlreadyConnected { plugin_id: String },

    /// No plugin is registered under this id.
    #[error("plugin not found: {plugin_id}")]
    NotFound { plugin_id: String },

    /// The plugin did not register within the handshake window.
    #[error("plugin {plugin_id} did not register within {timeout_ms}ms")]
    HandshakeTimeout { plugin_id: String, timeout_ms: u64 },

    /// The runtime's policy refused the plugin.
    #[error("plugin {plugin_id} rejected: {reason}")]
    PolicyRejected { plugin_id: String, reason: String },

    /// The bridge refuses more plugins than its configured limit.
    #[error("plugin limit reached ({limit})")]
    LimitReached { limit: usize },

    /// The external listener is already running.
    #[error("external listener already started")]
    AlreadyStarted,

    /// A caller-supplied argument is unusable (e.g. a socket path that
    /// points at a regular file).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A correlated call failed; the kernel's classification is preserved.
    #[error(transparent)]
    Call(#[from] KernelError),
}

impl NriError {
    /// `true` when the plugin (or the runtime policy) said no, as opposed to
    /// the plugin being unreachable.
    pub fn is_policy(&self) -> bool {
        match self {
            Self::PolicyRejected { .. } => true,
            Self::Call(e) => e.is_rejected(),
            _ => false,
        }
    }

    /// `true` for unknown-plugin failures, local or remote.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Call(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Convenience alias used throughout the plugin bridge crate.
pub type Result<T> = std::result::Result<T, NriError>;
