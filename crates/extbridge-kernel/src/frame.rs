//! Length-prefixed frame codec.
//!
//! Every connection carries a sequence of frames.  A frame is a 4-byte
//! big-endian body length followed by a JSON body.  Request ids are allocated
//! by whichever side sends the request, so `response`/`error` frames always
//! refer to the receiver's own outgoing requests while `request`/`cancel`
//! frames refer to the peer's.  That lets both directions share one stream.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{KernelError, Result};

/// Identifier of one correlated call, unique per connection and direction.
pub type CallId = u64;

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Call kinds
// ---------------------------------------------------------------------------

/// Every method carried over an extbridge connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    // runtime -> plugin
    Configure,
    Synchronize,
    CreateContainer,
    UpdateContainer,
    StopContainer,
    StateChange,
    Shutdown,
    // plugin -> runtime
    RegisterPlugin,
    UpdateContainers,
    // runtime -> sandboxer
    SandboxCreate,
    SandboxStart,
    SandboxPlatform,
    SandboxStop,
    SandboxWait,
    SandboxStatus,
    SandboxShutdown,
    SandboxMetrics,
    SandboxUpdate,
}

impl CallKind {
    /// The wire name of this method.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configure => "configure",
            Self::Synchronize => "synchronize",
            Self::CreateContainer => "create_container",
            Self::UpdateContainer => "update_container",
            Self::StopContainer => "stop_container",
            Self::StateChange => "state_change",
            Self::Shutdown => "shutdown",
            Self::RegisterPlugin => "register_plugin",
            Self::UpdateContainers => "update_containers",
            Self::SandboxCreate => "sandbox_create",
            Self::SandboxStart => "sandbox_start",
            Self::SandboxPlatform => "sandbox_platform",
            Self::SandboxStop => "sandbox_stop",
            Self::SandboxWait => "sandbox_wait",
            Self::SandboxStatus => "sandbox_status",
            Self::SandboxShutdown => "sandbox_shutdown",
            Self::SandboxMetrics => "sandbox_metrics",
            Self::SandboxUpdate => "sandbox_update",
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol-level error classes carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    Rejected,
    Unavailable,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::AlreadyExists => "already_exists",
            Self::Rejected => "rejected",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// One unit on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// A call issued by the sender.
    Request {
        id: CallId,
        kind: CallKind,
        #[serde(default)]
        payload: Value,
    },
    /// Successful answer to one of the receiver's requests.
    Response {
        id: CallId,
        #[serde(default)]
        payload: Value,
    },
    /// Failed answer to one of the receiver's requests.
    Error {
        id: CallId,
        code: ErrorCode,
        reason: String,
    },
    /// The sender gave up on one of its own requests.
    Cancel { id: CallId },
}

impl Frame {
    /// The call id this frame refers to.
    pub fn id(&self) -> CallId {
        match self {
            Self::Request { id, .. }
            | Self::Response { id, .. }
            | Self::Error { id, .. }
            | Self::Cancel { id } => *id,
        }
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Error { .. } => "error",
            Self::Cancel { .. } => "cancel",
        }
    }
}

/// Serialize `frame` into a body ready for [`write_encoded`].
///
/// Fails with `FrameTooLarge` when the body exceeds [`MAX_FRAME_LEN`]; nothing
/// has touched the stream at that point.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(KernelError::FrameTooLarge {
            len: body.len(),
            limit: MAX_FRAME_LEN,
        });
    }
    Ok(body)
}

/// Write an already encoded body with its length prefix, then flush.
pub async fn write_encoded<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len()).map_err(|_| KernelError::FrameTooLarge {
        len: body.len(),
        limit: MAX_FRAME_LEN,
    })?;
    writer.write_u32(len).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode and write one frame, then flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = encode_frame(frame)?;
    write_encoded(writer, &body).await
}

/// Read one frame.
///
/// Returns `Ok(None)` on a clean end of stream at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(KernelError::FrameTooLarge {
            len,
            limit: MAX_FRAME_LEN,
        });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let frame = serde_json::from_slice(&body)?;
    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_json_shape() {
        let frame = Frame::Request {
            id: 7,
            kind: CallKind::UpdateContainers,
            payload: serde_json::json!({"update": []}),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "request");
        assert_eq!(json["id"], 7);
        assert_eq!(json["kind"], "update_containers");
    }

    #[test]
    fn kind_display_matches_serde() {
        for kind in [CallKind::SandboxWait, CallKind::StopContainer, CallKind::Shutdown] {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, kind.to_string());
        }
    }

    #[tokio::test]
    async fn frames_cross_a_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let sent = Frame::Error {
            id: 3,
            code: ErrorCode::NotFound,
            reason: "no such sandbox".into(),
        };
        write_frame(&mut a, &sent).await.unwrap();
        write_frame(&mut a, &Frame::Cancel { id: 4 }).await.unwrap();
        drop(a);

        assert_eq!(read_frame(&mut b).await.unwrap(), Some(sent));
        assert_eq!(read_frame(&mut b).await.unwrap(), Some(Frame::Cancel { id: 4 }));
        assert_eq!(read_frame(&mut b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversized_length_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRAME_LEN + 1) as u32).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, KernelError::FrameTooLarge { .. }));
    }

    #[test]
    fn oversized_body_is_refused_before_writing() {
        let frame = Frame::Response {
            id: 1,
            payload: Value::String("x".repeat(MAX_FRAME_LEN)),
        };
        let err = encode_frame(&frame).unwrap_err();
        assert!(matches!(err, KernelError::FrameTooLarge { limit, .. } if limit == MAX_FRAME_LEN));
    }

    #[tokio::test]
    async fn missing_payload_defaults_to_null() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let body = br#"{"type":"response","id":9}"#;
        a.write_u32(body.len() as u32).await.unwrap();
        a.write_all(body).await.unwrap();
        let frame = read_frame(&mut b).await.unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Response {
                id: 9,
                payload: Value::Null
            }
        );
    }
}
