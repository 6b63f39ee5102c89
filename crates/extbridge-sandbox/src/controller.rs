//! Sandbox controller handle.
//!
//! A [`SandboxController`] is bound to one `(sandboxer name, address)` pair
//! for its whole life.  It owns a single channel to the sandboxer, dialed on
//! first use and redialed on the next call after it closes; every lifecycle
//! call is one correlated round trip over that channel.  Failures are handed
//! back to the caller as they happened: the controller never retries.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use extbridge_kernel::{CallKind, Connection, Event, EventBus, KernelError, NoInbound};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::ControllerConfig;
use crate::dialer::{Dialer, NetDialer, SandboxAddress};
use crate::error::{Result, SandboxError};
use crate::state::SandboxState;
use crate::types::{
    CreateRequest, CreateResponse, MetricsRequest, MetricsResponse, PlatformRequest,
    PlatformResponse, SandboxRequest, ShutdownRequest, ShutdownResponse, StartRequest,
    StartResponse, StatusRequest, StatusResponse, StopRequest, StopResponse, UpdateRequest,
    UpdateResponse, WaitRequest, WaitResponse,
};
use crate::wait::{WaitCallbacks, WaitOutcome, WaitSubscription};

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures a [`SandboxController`] before it is built.
pub struct ControllerBuilder {
    sandboxer: String,
    address: String,
    config: ControllerConfig,
    dialer: Arc<dyn Dialer>,
    events: Option<EventBus>,
}

impl ControllerBuilder {
    /// Override the deadlines.
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a custom dialer instead of [`NetDialer`].
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Publish wait outcomes on `bus`.
    pub fn events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    /// Finish construction.  Performs no network activity.
    pub fn build(self) -> SandboxController {
        let parsed = SandboxAddress::parse(&self.address);
        match &parsed {
            Ok(address) => tracing::info!(
                sandboxer = %self.sandboxer,
                address = %address,
                "sandbox controller built"
            ),
            Err(reason) => tracing::warn!(
                sandboxer = %self.sandboxer,
                address = %self.address,
                reason = %reason,
                "sandbox controller built with an unusable address"
            ),
        }

        SandboxController {
            inner: Arc::new(ControllerInner {
                sandboxer: self.sandboxer,
                address: self.address,
                parsed,
                config: self.config,
                dialer: self.dialer,
                channel: Mutex::new(None),
                events: self.events,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// SandboxController
// ---------------------------------------------------------------------------

/// Handle to one sandboxer.  Cheap to clone; clones share the channel.
#[derive(Clone)]
pub struct SandboxController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    sandboxer: String,
    /// The address exactly as given.
    address: String,
    parsed: std::result::Result<SandboxAddress, String>,
    config: ControllerConfig,
    dialer: Arc<dyn Dialer>,
    channel: Mutex<Option<Connection>>,
    events: Option<EventBus>,
}

impl SandboxController {
    /// Build a controller with default deadlines and the network dialer.
    pub fn build(sandboxer: impl Into<String>, address: impl Into<String>) -> Self {
        Self::builder(sandboxer, address).build()
    }

    pub fn builder(sandboxer: impl Into<String>, address: impl Into<String>) -> ControllerBuilder {
        ControllerBuilder {
            sandboxer: sandboxer.into(),
            address: address.into(),
            config: ControllerConfig::default(),
            dialer: Arc::new(NetDialer),
            events: None,
        }
    }

    /// The sandboxer name this handle is bound to.
    pub fn sandboxer(&self) -> &str {
        &self.inner.sandboxer
    }

    /// The address as given to `build`.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    /// Whether a live channel to the sandboxer is currently held.
    pub async fn is_connected(&self) -> bool {
        self.inner
            .channel
            .lock()
            .await
            .as_ref()
            .is_some_and(|conn| !conn.is_closed())
    }

    /// Drop the channel.  Calls in flight fail `peer-disconnected`; the next
    /// call dials again.
    pub async fn close(&self) -> bool {
        match self.inner.channel.lock().await.take() {
            Some(conn) => conn.close(),
            None => false,
        }
    }

    // -- lifecycle calls ----------------------------------------------------

    pub async fn create(&self, request: CreateRequest) -> Result<CreateResponse> {
        self.call(CallKind::SandboxCreate, request, self.inner.config.call_timeout)
            .await
    }

    pub async fn start(&self, request: StartRequest) -> Result<StartResponse> {
        self.call(CallKind::SandboxStart, request, self.inner.config.call_timeout)
            .await
    }

    pub async fn platform(&self, request: PlatformRequest) -> Result<PlatformResponse> {
        self.call(CallKind::SandboxPlatform, request, self.inner.config.call_timeout)
            .await
    }

    /// Stop a sandbox.  The deadline is the call timeout plus the grace
    /// period the request grants the sandbox.
    ///
    /// Whether stopping an already stopped sandbox succeeds or reports
    /// not-found is the sandboxer's decision.
    pub async fn stop(&self, request: StopRequest) -> Result<StopResponse> {
        let timeout =
            self.inner.config.call_timeout + Duration::from_secs(u64::from(request.timeout_secs));
        self.call(CallKind::SandboxStop, request, timeout).await
    }

    pub async fn status(&self, request: StatusRequest) -> Result<StatusResponse> {
        self.call(CallKind::SandboxStatus, request, self.inner.config.call_timeout)
            .await
    }

    pub async fn shutdown(&self, request: ShutdownRequest) -> Result<ShutdownResponse> {
        self.call(CallKind::SandboxShutdown, request, self.inner.config.call_timeout)
            .await
    }

    pub async fn metrics(&self, request: MetricsRequest) -> Result<MetricsResponse> {
        self.call(CallKind::SandboxMetrics, request, self.inner.config.call_timeout)
            .await
    }

    pub async fn update(&self, request: UpdateRequest) -> Result<UpdateResponse> {
        self.call(CallKind::SandboxUpdate, request, self.inner.config.call_timeout)
            .await
    }

    /// One fresh status round trip, classified.  A sandbox the sandboxer
    /// does not know is [`SandboxState::NotFound`], not an error.
    pub async fn state(&self, sandbox_id: &str) -> Result<SandboxState> {
        let request = StatusRequest {
            sandbox_id: sandbox_id.to_string(),
            ..Default::default()
        };
        match self.status(request).await {
            Ok(resp) => Ok(SandboxState::parse(&resp.state)),
            Err(e) if e.is_not_found() => Ok(SandboxState::NotFound),
            Err(e) => Err(e),
        }
    }

    // -- wait ---------------------------------------------------------------

    /// Observe the sandbox's next transition and fire exactly one callback.
    ///
    /// Returns after at most `wait_ready_window` plus one status round trip,
    /// never after the sandbox's whole lifetime.  The returned outcome is the
    /// one delivered to the callbacks.
    pub async fn wait<C>(
        &self,
        request: WaitRequest,
        callbacks: WaitCallbacks<C>,
        context: C,
    ) -> WaitOutcome {
        let subscription = WaitSubscription::new(request.sandbox_id.clone(), callbacks, context);
        let outcome = self.classify_wait(request).await;

        if let Some(bus) = &self.inner.events {
            bus.publish(Event::SandboxWaitResolved {
                sandbox_id: subscription.sandbox_id().to_string(),
                outcome: outcome.label().to_string(),
                timestamp: Utc::now(),
            });
        }
        subscription.fire(&outcome);
        outcome
    }

    /// Run [`wait`](Self::wait) on its own task.
    pub fn wait_detached<C>(
        &self,
        request: WaitRequest,
        callbacks: WaitCallbacks<C>,
        context: C,
    ) -> JoinHandle<WaitOutcome>
    where
        C: Send + 'static,
    {
        let controller = self.clone();
        tokio::spawn(async move { controller.wait(request, callbacks, context).await })
    }

    async fn classify_wait(&self, request: WaitRequest) -> WaitOutcome {
        let sandbox_id = request.sandbox_id.clone();
        let window = self.inner.config.wait_ready_window;

        match self
            .call::<_, WaitResponse>(CallKind::SandboxWait, request, window)
            .await
        {
            Ok(mut resp) => {
                if resp.sandbox_id.is_empty() {
                    resp.sandbox_id = sandbox_id;
                }
                WaitOutcome::Exited(resp)
            }
            Err(e) if e.is_not_found() => WaitOutcome::Exited(WaitResponse::unknown_exit(sandbox_id)),
            Err(e) if e.is_deadline() => match self.state(&sandbox_id).await {
                Ok(state) if state.is_ready() => WaitOutcome::Ready,
                Ok(SandboxState::NotFound) => {
                    WaitOutcome::Exited(WaitResponse::unknown_exit(sandbox_id))
                }
                Ok(state) => WaitOutcome::Pending {
                    reason: format!("sandbox is {state}"),
                },
                Err(e) => WaitOutcome::Pending {
                    reason: e.to_string(),
                },
            },
            Err(e) => {
                tracing::debug!(sandbox_id = %sandbox_id, error = %e, "wait failed; reporting pending");
                WaitOutcome::Pending {
                    reason: e.to_string(),
                }
            }
        }
    }

    // -- internals ----------------------------------------------------------

    async fn call<Req, Resp>(&self, kind: CallKind, mut request: Req, timeout: Duration) -> Result<Resp>
    where
        Req: SandboxRequest + Serialize,
        Resp: DeserializeOwned,
    {
        if request.sandboxer_mut().is_empty() {
            *request.sandboxer_mut() = self.inner.sandboxer.clone();
        }
        let conn = self.channel().await?;

        tracing::debug!(
            sandboxer = %self.inner.sandboxer,
            sandbox_id = %request.sandbox_id(),
            kind = %kind,
            "sandbox call"
        );
        let payload = serde_json::to_value(&request).map_err(KernelError::from)?;
        let value = match conn.call(kind, payload, Some(timeout)).await {
            Ok(value) => value,
            Err(e) => {
                // A wait running out its window is how a live sandbox is polled.
                let polled = kind == CallKind::SandboxWait && matches!(e, KernelError::DeadlineExceeded { .. });
                if e.is_transport() && !polled {
                    tracing::warn!(
                        sandboxer = %self.inner.sandboxer,
                        sandbox_id = %request.sandbox_id(),
                        kind = %kind,
                        error = %e,
                        "sandbox call failed"
                    );
                } else {
                    tracing::debug!(sandbox_id = %request.sandbox_id(), kind = %kind, error = %e, "sandbox call failed");
                }
                return Err(e.into());
            }
        };
        let value = if value.is_null() {
            Value::Object(serde_json::Map::new())
        } else {
            value
        };
        serde_json::from_value(value).map_err(|source| SandboxError::Decode { kind, source })
    }

    /// The live channel, dialing a new one if there is none or it closed.
    async fn channel(&self) -> Result<Connection> {
        let address = self
            .inner
            .parsed
            .as_ref()
            .map_err(|reason| SandboxError::InvalidAddress {
                address: self.inner.address.clone(),
                reason: reason.clone(),
            })?;

        let mut slot = self.inner.channel.lock().await;
        if let Some(conn) = slot.as_ref().filter(|conn| !conn.is_closed()) {
            return Ok(conn.clone());
        }

        let dial = self.inner.dialer.dial(address);
        let stream = match tokio::time::timeout(self.inner.config.connect_timeout, dial).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(sandboxer = %self.inner.sandboxer, address = %address, error = %e, "dial failed");
                return Err(self.unreachable());
            }
            Err(_) => {
                tracing::warn!(
                    sandboxer = %self.inner.sandboxer,
                    address = %address,
                    timeout_ms = self.inner.config.connect_timeout.as_millis() as u64,
                    "dial timed out"
                );
                return Err(self.unreachable());
            }
        };

        let conn = Connection::open(self.inner.sandboxer.clone(), stream, Arc::new(NoInbound));
        tracing::info!(
            sandboxer = %self.inner.sandboxer,
            address = %address,
            connection_id = conn.id(),
            "sandboxer channel established"
        );
        *slot = Some(conn.clone());
        Ok(conn)
    }

    fn unreachable(&self) -> SandboxError {
        KernelError::PeerDisconnected {
            peer: self.inner.sandboxer.clone(),
        }
        .into()
    }
}

impl fmt::Debug for SandboxController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxController")
            .field("sandboxer", &self.inner.sandboxer)
            .field("address", &self.inner.address)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
