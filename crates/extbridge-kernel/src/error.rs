//! Kernel error types.
//!
//! Every failure the connection engine can produce surfaces as a
//! [`KernelError`].  The variants mirror the failure taxonomy callers act on:
//! lookups that miss, duplicate registrations, local deadlines, lost peers,
//! explicit remote errors and policy refusals.  Transport internals never leak
//! past this type.

use crate::frame::{CallKind, ErrorCode};

/// Unified error type for the extbridge kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Registry errors ----------------------------------------------------
    /// The referenced peer (plugin, sandbox, connection) is not registered.
    #[error("not found: {id}")]
    NotFound {
        /// The identifier that was looked up.
        id: String,
    },

    /// A live peer is already registered under this identifier.
    #[error("already exists: {id}")]
    AlreadyExists { id: String },

    // -- Call resolution errors ---------------------------------------------
    /// The call did not resolve before its local deadline.
    #[error("deadline exceeded: {kind} after {timeout_ms}ms")]
    DeadlineExceeded {
        /// Which call timed out.
        kind: CallKind,
        /// The deadline that was applied, in milliseconds.
        timeout_ms: u64,
    },

    /// The connection to the peer closed before the call resolved, or the
    /// peer could not be reached at all.
    #[error("peer disconnected: {peer}")]
    PeerDisconnected { peer: String },

    /// The peer answered with an explicit protocol error.  `reason` is the
    /// peer's text, preserved verbatim.
    #[error("remote error ({code}): {reason}")]
    RemoteError { code: ErrorCode, reason: String },

    /// A runtime-side policy declined an otherwise well-formed request.
    #[error("policy rejected: {reason}")]
    PolicyRejected { reason: String },

    // -- Codec errors -------------------------------------------------------
    /// A frame or payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A frame body, incoming or outgoing, exceeds the configured limit.
    #[error("frame too large: {len} > {limit}")]
    FrameTooLarge { len: usize, limit: usize },

    /// An I/O error on the underlying stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors.  Prefer a typed variant
    /// whenever possible.
    #[error("internal kernel error: {0}")]
    Internal(String),
}

impl KernelError {
    /// `true` when the failure means "the referenced thing does not exist",
    /// whether decided locally or reported by the peer.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::RemoteError {
                    code: ErrorCode::NotFound,
                    ..
                }
        )
    }

    /// `true` when the failure is a policy decision rather than a transport
    /// or timeout problem.
    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            Self::PolicyRejected { .. }
                | Self::RemoteError {
                    code: ErrorCode::Rejected,
                    ..
                }
        )
    }

    /// `true` for failures caused by the channel rather than by the peer's
    /// answer: deadlines, disconnects and stream errors.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::DeadlineExceeded { .. } | Self::PeerDisconnected { .. } | Self::Io(_)
        )
    }

    /// The code sent to the peer when this error answers one of its requests.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            Self::PolicyRejected { .. } => ErrorCode::Rejected,
            Self::RemoteError { code, .. } => *code,
            Self::DeadlineExceeded { .. } | Self::PeerDisconnected { .. } => {
                ErrorCode::Unavailable
            }
            _ => ErrorCode::Internal,
        }
    }

    /// The reason text sent to the peer.  Policy and remote reasons travel
    /// without the local prefix so the far side sees them verbatim.
    pub fn wire_reason(&self) -> String {
        match self {
            Self::PolicyRejected { reason } | Self::RemoteError { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }

    /// Rebuild an error received in an `error` frame.
    pub fn from_wire(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self::RemoteError {
            code,
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
