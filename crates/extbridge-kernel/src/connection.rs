//! Owned, multiplexed peer connection.
//!
//! A [`Connection`] takes ownership of a byte stream and runs two background
//! tasks over it: a reader that decodes frames and routes them, and a writer
//! that serializes outgoing frames in submission order.  Outgoing calls are
//! correlated by id through a per-connection [`Correlator`], so any number of
//! calls may be in flight at once and the peer may answer them in any order.
//! Requests initiated by the peer are dispatched to an [`InboundHandler`],
//! each on its own task.
//!
//! Handles are cheap to clone.  The stream is released when the connection is
//! closed explicitly, when the peer hangs up, or when the last handle drops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::AbortHandle;

use crate::correlator::Correlator;
use crate::error::{KernelError, Result};
use crate::frame::{CallId, CallKind, Frame, encode_frame, read_frame, write_encoded};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Inbound dispatch
// ---------------------------------------------------------------------------

/// Serves requests initiated by the remote peer.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    /// Handle one inbound call and produce its response payload.
    ///
    /// An `Err` is sent back to the peer as an `error` frame carrying the
    /// error's code and reason.
    async fn handle(&self, kind: CallKind, payload: Value) -> Result<Value>;
}

/// Handler for connections whose peer is never expected to call back.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInbound;

#[async_trait]
impl InboundHandler for NoInbound {
    async fn handle(&self, kind: CallKind, _payload: Value) -> Result<Value> {
        Err(KernelError::PolicyRejected {
            reason: format!("method {kind} is not served on this connection"),
        })
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A live, multiplexed connection to one peer.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: u64,
    peer: String,
    correlator: Correlator,
    outbound: mpsc::UnboundedSender<Outgoing>,
    closed: watch::Sender<bool>,
    inbound: DashMap<CallId, AbortHandle>,
}

impl Connection {
    /// Take ownership of `stream` and start serving it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open<S>(peer: impl Into<String>, stream: S, handler: Arc<dyn InboundHandler>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = peer.into();
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let inner = Arc::new(ConnectionInner {
            id,
            correlator: Correlator::new(peer.clone()),
            peer,
            outbound,
            closed,
            inbound: DashMap::new(),
        });

        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(read_loop(
            Arc::downgrade(&inner),
            BufReader::new(reader),
            inner.closed.subscribe(),
            handler,
        ));
        tokio::spawn(write_loop(
            Arc::downgrade(&inner),
            writer,
            outbound_rx,
            inner.closed.subscribe(),
        ));

        tracing::debug!(connection_id = id, peer = %inner.peer, "connection opened");
        Self { inner }
    }

    /// Process-unique identifier of this connection.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The peer this connection talks to.
    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    /// Issue a correlated call and suspend until it resolves.
    ///
    /// Resolves with the peer's response, `DeadlineExceeded` when `timeout`
    /// elapses first, `PeerDisconnected` when the connection goes away, or
    /// `RemoteError` when the peer answers with an error frame.  On a deadline
    /// a `cancel` frame is sent to the peer as a hint; the local entry is
    /// released regardless.
    ///
    /// A request whose encoded body exceeds the frame limit fails with
    /// `FrameTooLarge` without being sent; the connection stays open.
    pub async fn call(&self, kind: CallKind, payload: Value, timeout: Option<Duration>) -> Result<Value> {
        let correlator = &self.inner.correlator;
        let (id, slot) = correlator.register(kind);
        let _guard = ForgetOnDrop { correlator, id };

        let request = match Outgoing::encode(&Frame::Request { id, kind, payload }) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(peer = %self.inner.peer, call_id = id, kind = %kind, error = %e, "request not sent");
                return Err(e);
            }
        };

        tracing::trace!(peer = %self.inner.peer, call_id = id, kind = %kind, "sending request");
        if self.inner.outbound.send(request).is_err() {
            correlator.resolve(
                id,
                Err(KernelError::PeerDisconnected {
                    peer: self.inner.peer.clone(),
                }),
            );
        }

        let result = correlator.wait(id, kind, slot, timeout).await;
        if let Err(KernelError::DeadlineExceeded { timeout_ms, .. }) = &result {
            // Callers decide whether a deadline is worth a warning.
            tracing::debug!(
                peer = %self.inner.peer,
                call_id = id,
                kind = %kind,
                timeout_ms,
                "call deadline exceeded"
            );
            if let Ok(cancel) = Outgoing::encode(&Frame::Cancel { id }) {
                let _ = self.inner.outbound.send(cancel);
            }
        }
        result
    }

    /// Typed wrapper over [`call`](Self::call).
    pub async fn call_typed<Req, Resp>(
        &self,
        kind: CallKind,
        request: &Req,
        timeout: Option<Duration>,
    ) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(request)?;
        let value = self.call(kind, payload, timeout).await?;
        // Acknowledgements may come back without a body.
        let value = if value.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            value
        };
        Ok(serde_json::from_value(value)?)
    }

    /// Close the connection.
    ///
    /// Every pending call resolves with `PeerDisconnected`, inbound handlers
    /// are aborted, queued frames are flushed and the write half is shut
    /// down.  Returns `false` if the connection was already closed.
    pub fn close(&self) -> bool {
        self.inner.close("closed locally")
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// A close notification that does not keep the connection alive.
    pub fn close_signal(&self) -> CloseSignal {
        CloseSignal {
            rx: self.inner.closed.subscribe(),
        }
    }

    /// Number of outgoing calls still awaiting resolution.
    pub fn outstanding_calls(&self) -> usize {
        self.inner.correlator.outstanding()
    }

}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Close notification detached from the connection's lifetime.
pub struct CloseSignal {
    rx: watch::Receiver<bool>,
}

impl CloseSignal {
    /// Resolves once the connection is closed or dropped.
    pub async fn wait(mut self) {
        let _ = self.rx.wait_for(|closed| *closed).await;
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

impl ConnectionInner {
    fn close(&self, reason: &str) -> bool {
        let first = self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
        if !first {
            return false;
        }

        let failed = self.correlator.fail_all();
        self.inbound.retain(|_, task| {
            task.abort();
            false
        });
        tracing::debug!(
            connection_id = self.id,
            peer = %self.peer,
            reason,
            failed_calls = failed,
            "connection closed"
        );
        true
    }

    fn dispatch(self: &Arc<Self>, frame: Frame, handler: &Arc<dyn InboundHandler>) {
        tracing::trace!(peer = %self.peer, call_id = frame.id(), frame = frame.label(), "frame received");
        match frame {
            Frame::Response { id, payload } => {
                if !self.correlator.resolve(id, Ok(payload)) {
                    tracing::debug!(peer = %self.peer, call_id = id, "late response dropped");
                }
            }
            Frame::Error { id, code, reason } => {
                if !self.correlator.resolve(id, Err(KernelError::from_wire(code, reason))) {
                    tracing::debug!(peer = %self.peer, call_id = id, "late error dropped");
                }
            }
            Frame::Request { id, kind, payload } => self.serve(id, kind, payload, handler.clone()),
            Frame::Cancel { id } => {
                if let Some((_, task)) = self.inbound.remove(&id) {
                    task.abort();
                    tracing::debug!(peer = %self.peer, call_id = id, "inbound call cancelled by peer");
                }
            }
        }
    }

    fn serve(self: &Arc<Self>, id: CallId, kind: CallKind, payload: Value, handler: Arc<dyn InboundHandler>) {
        let outbound = self.outbound.clone();
        let weak = Arc::downgrade(self);
        // The task waits for its abort handle to be recorded before running,
        // so its own removal can never precede the insert.
        let (start_tx, start_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            if start_rx.await.is_err() {
                return;
            }
            let reply = match handler.handle(kind, payload).await {
                Ok(payload) => Outgoing::encode(&Frame::Response { id, payload }),
                Err(e) => {
                    tracing::debug!(call_id = id, kind = %kind, error = %e, "inbound call failed");
                    Outgoing::error(id, &e)
                }
            };
            // A reply too large for one frame is answered with the encoding
            // failure instead, so the peer's call still resolves.
            let reply = reply.or_else(|e| {
                tracing::warn!(call_id = id, kind = %kind, error = %e, "inbound reply not sent");
                Outgoing::error(id, &e)
            });
            if let Ok(reply) = reply {
                let _ = outbound.send(reply);
            }
            if let Some(inner) = weak.upgrade() {
                inner.inbound.remove(&id);
            }
        });

        self.inbound.insert(id, task.abort_handle());
        let _ = start_tx.send(());
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.close("last handle dropped");
    }
}

/// A frame encoded ahead of the writer, so size failures stay with the
/// caller instead of the stream.
struct Outgoing {
    id: CallId,
    label: &'static str,
    body: Vec<u8>,
}

impl Outgoing {
    fn encode(frame: &Frame) -> Result<Self> {
        Ok(Self {
            id: frame.id(),
            label: frame.label(),
            body: encode_frame(frame)?,
        })
    }

    fn error(id: CallId, error: &KernelError) -> Result<Self> {
        Self::encode(&Frame::Error {
            id,
            code: error.code(),
            reason: error.wire_reason(),
        })
    }
}

/// Releases a pending entry when the calling future is dropped mid-call.
struct ForgetOnDrop<'a> {
    correlator: &'a Correlator,
    id: CallId,
}

impl Drop for ForgetOnDrop<'_> {
    fn drop(&mut self) {
        self.correlator.forget(self.id);
    }
}

async fn read_loop<R>(
    weak: Weak<ConnectionInner>,
    mut reader: R,
    mut closed: watch::Receiver<bool>,
    handler: Arc<dyn InboundHandler>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let reason = loop {
        let next = tokio::select! {
            next = read_frame(&mut reader) => next,
            // The borrow returned by `wait_for` must not outlive the branch.
            _ = async { let _ = closed.wait_for(|c| *c).await; } => return,
        };

        match next {
            Ok(Some(frame)) => {
                let Some(inner) = weak.upgrade() else { return };
                inner.dispatch(frame, &handler);
            }
            Ok(None) => break "peer closed the stream",
            Err(e) => {
                tracing::warn!(error = %e, "connection read failed");
                break "read error";
            }
        }
    };

    if let Some(inner) = weak.upgrade() {
        inner.close(reason);
    }
}

async fn write_loop<W>(
    weak: Weak<ConnectionInner>,
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<Outgoing>,
    mut closed: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = write_encoded(&mut writer, &frame.body).await {
                    tracing::warn!(error = %e, call_id = frame.id, frame = frame.label, "connection write failed");
                    if let Some(inner) = weak.upgrade() {
                        inner.close("write error");
                    }
                    return;
                }
            }
            _ = async { let _ = closed.wait_for(|c| *c).await; } => {
                // Flush whatever was queued before the close.
                while let Ok(frame) = frames.try_recv() {
                    if write_encoded(&mut writer, &frame.body).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
