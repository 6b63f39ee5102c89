//! Sandbox controller error types.
//!
//! All sandbox controller APIs surface errors through [`SandboxError`].
//! Transport, deadline and remote failures keep their kernel classification
//! in [`SandboxError::Call`].

use extbridge_kernel::{CallKind, KernelError};

/// Unified error type for the sandbox controller.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The controller was built with an address it cannot dial.
    #[error("invalid sandboxer address {address:?}: {reason}")]
    InvalidAddress {
        /// The address as given to `build`.
        address: String,
        reason: String,
    },

    /// The sandboxer answered with a body that does not match the call.
    #[error("malformed {kind} response: {source}")]
    Decode {
        kind: CallKind,
        #[source]
        source: serde_json::Error,
    },

    /// A correlated call failed; the kernel's classification is preserved.
    #[error(transparent)]
    Call(#[from] KernelError),
}

impl SandboxError {
    /// `true` when the sandboxer reported the sandbox as unknown.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Call(e) if e.is_not_found())
    }

    /// `true` when the call ran out of time locally.
    pub fn is_deadline(&self) -> bool {
        matches!(self, Self::Call(KernelError::DeadlineExceeded { .. }))
    }

    /// `true` when the sandboxer could not be reached or went away.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Call(KernelError::PeerDisconnected { .. }))
    }
}

/// Convenience alias used throughout the sandbox crate.
pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;
    use extbridge_kernel::ErrorCode;

    #[test]
    fn invalid_address_display() {
        let err = SandboxError::InvalidAddress {
            address: "ftp://x".into(),
            reason: "unsupported scheme".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid sandboxer address \"ftp://x\": unsupported scheme"
        );
    }

    #[test]
    fn classification_helpers() {
        let nf = SandboxError::from(KernelError::from_wire(ErrorCode::NotFound, "sandbox sb1 not found"));
        assert!(nf.is_not_found());
        assert!(!nf.is_deadline());

        let gone = SandboxError::from(KernelError::PeerDisconnected { peer: "sb".into() });
        assert!(gone.is_disconnected());
        assert!(!gone.is_not_found());

        let late = SandboxError::from(KernelError::DeadlineExceeded {
            kind: CallKind::SandboxWait,
            timeout_ms: 500,
        });
        assert!(late.is_deadline());
    }
}
