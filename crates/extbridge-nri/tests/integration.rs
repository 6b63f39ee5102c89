//! Integration tests for the extbridge-nri crate.
//!
//! Each test runs a fake plugin on the far side of an in-memory stream.  The
//! fake plugin is itself a kernel `Connection`, so it registers, answers and
//! calls back exactly like a real plugin speaking the frame protocol.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use extbridge_kernel::{CallKind, Connection, ConnectionState, Event, InboundHandler, KernelError};
use extbridge_nri::types::{
    ConfigureRequest, ContainerUpdate, CreateContainerRequest, Event as NriEvent, EventMask,
    RegisterPluginRequest, StateChangeEvent, UpdateContainersRequest, UpdateContainersResponse,
};
use extbridge_nri::{BridgeConfig, NriError, PluginBridge, RegistrationDecision, RuntimeHandler};
use serde_json::{Value, json};
use tokio::task::JoinHandle;

// ═══════════════════════════════════════════════════════════════════════
//  Fixtures
// ═══════════════════════════════════════════════════════════════════════

/// Accepts every plugin except "evil"; echoes updates back as failed, with
/// updates for "slow*" containers answered late.
struct TestRuntime;

#[async_trait]
impl RuntimeHandler for TestRuntime {
    async fn register_plugin(&self, _plugin_id: &str, request: &RegisterPluginRequest) -> RegistrationDecision {
        if request.plugin_name == "evil" {
            RegistrationDecision::Reject {
                reason: "plugin evil is not allowed".into(),
            }
        } else {
            RegistrationDecision::Accept
        }
    }

    async fn update_containers(
        &self,
        _plugin_id: &str,
        request: UpdateContainersRequest,
    ) -> extbridge_nri::Result<UpdateContainersResponse> {
        if request.update.iter().any(|u| u.container_id.starts_with("slow")) {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        Ok(UpdateContainersResponse {
            failed: request.update,
        })
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Responsive,
    /// Never answers `configure`.
    HangOnConfigure,
}

struct FakePlugin {
    mode: Mode,
}

#[async_trait]
impl InboundHandler for FakePlugin {
    async fn handle(&self, kind: CallKind, payload: Value) -> extbridge_kernel::Result<Value> {
        match kind {
            CallKind::Configure if self.mode == Mode::HangOnConfigure => {
                std::future::pending::<extbridge_kernel::Result<Value>>().await
            }
            CallKind::Configure => Ok(json!({
                "events": EventMask::default().with(NriEvent::CreateContainer).0,
            })),
            CallKind::CreateContainer => {
                let id = payload["container"]["id"].as_str().unwrap_or_default().to_string();
                Ok(json!({
                    "adjust": {"annotations": {"touched-by": "fake"}},
                    "update": [{"container_id": id}],
                }))
            }
            CallKind::StateChange | CallKind::Shutdown => Ok(json!({})),
            other => Err(KernelError::Internal(format!("unexpected {other}"))),
        }
    }
}

fn bridge() -> PluginBridge {
    PluginBridge::new(Arc::new(TestRuntime), BridgeConfig::default())
}

/// Start a fake plugin and the bridge's side of its connection.  The plugin
/// registers immediately under `name`.
fn spawn_plugin(
    bridge: &PluginBridge,
    plugin_id: &str,
    name: &str,
    mode: Mode,
    timeout: Duration,
) -> (Connection, JoinHandle<extbridge_nri::Result<()>>) {
    let (runtime_end, plugin_end) = tokio::io::duplex(64 * 1024);
    let plugin = Connection::open("runtime", plugin_end, Arc::new(FakePlugin { mode }));

    let connect = tokio::spawn({
        let bridge = bridge.clone();
        let plugin_id = plugin_id.to_string();
        async move { bridge.connect(plugin_id, runtime_end, timeout).await }
    });

    tokio::spawn({
        let plugin = plugin.clone();
        let request = json!({"plugin_name": name, "plugin_idx": "10"});
        async move {
            let _ = plugin
                .call(CallKind::RegisterPlugin, request, Some(Duration::from_secs(5)))
                .await;
        }
    });

    (plugin, connect)
}

async fn connected_plugin(bridge: &PluginBridge, plugin_id: &str, mode: Mode, timeout: Duration) -> Connection {
    let (plugin, connect) = spawn_plugin(bridge, plugin_id, "fake", mode, timeout);
    connect.await.unwrap().expect("plugin should connect");
    plugin
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// ═══════════════════════════════════════════════════════════════════════
//  Connect and handshake
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn accepted_plugin_is_connected_with_metadata() {
    let bridge = bridge();
    let mut events = bridge.events().subscribe();
    let _plugin = connected_plugin(&bridge, "p1", Mode::Responsive, Duration::from_secs(2)).await;

    assert!(bridge.is_connected("p1"));
    let plugins = bridge.plugins();
    assert_eq!(plugins.len(), 1);
    assert_eq!(plugins[0].id, "p1");
    assert_eq!(plugins[0].name, "fake");
    assert_eq!(plugins[0].index, "10");
    assert_eq!(plugins[0].state, ConnectionState::Connected);
    assert_eq!(plugins[0].call_timeout_ms, 2000);

    assert!(matches!(events.recv().await.unwrap().as_ref(), Event::PeerConnected { peer, .. } if peer == "p1"));
    assert!(matches!(events.recv().await.unwrap().as_ref(), Event::PeerRegistered { name, .. } if name == "fake"));
}

#[tokio::test]
async fn rejected_plugin_is_closed_and_not_registered() {
    let bridge = bridge();
    let (plugin, connect) = spawn_plugin(&bridge, "p1", "evil", Mode::Responsive, Duration::from_secs(2));

    let err = connect.await.unwrap().unwrap_err();
    assert!(err.is_policy(), "expected policy rejection, got {err:?}");
    assert!(matches!(err, NriError::PolicyRejected { ref reason, .. } if reason == "plugin evil is not allowed"));
    assert!(bridge.plugins().is_empty());

    tokio::time::timeout(Duration::from_secs(1), plugin.closed())
        .await
        .expect("rejected plugin connection should be closed");
}

#[tokio::test]
async fn silent_plugin_times_out_handshake() {
    let bridge = bridge();
    let (runtime_end, plugin_end) = tokio::io::duplex(1024);
    let plugin = Connection::open("runtime", plugin_end, Arc::new(FakePlugin { mode: Mode::Responsive }));

    let err = bridge
        .connect("p1", runtime_end, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, NriError::HandshakeTimeout { timeout_ms: 100, .. }));
    assert!(bridge.plugins().is_empty());
    tokio::time::timeout(Duration::from_secs(1), plugin.closed()).await.unwrap();
}

#[tokio::test]
async fn second_connect_for_live_id_is_refused() {
    let bridge = bridge();
    let _first = connected_plugin(&bridge, "p1", Mode::Responsive, Duration::from_secs(2)).await;

    let (_second, connect) = spawn_plugin(&bridge, "p1", "fake", Mode::Responsive, Duration::from_secs(2));
    let err = connect.await.unwrap().unwrap_err();
    assert!(matches!(err, NriError::AlreadyConnected { .. }));
    assert!(bridge.is_connected("p1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_connects_for_one_id_have_one_winner() {
    let bridge = bridge();
    let mut plugins = Vec::new();
    let mut connects = Vec::new();
    for _ in 0..8 {
        let (plugin, connect) = spawn_plugin(&bridge, "p1", "fake", Mode::Responsive, Duration::from_secs(2));
        plugins.push(plugin);
        connects.push(connect);
    }

    let results = futures::future::join_all(connects).await;
    let winners = results.iter().filter(|r| matches!(r, Ok(Ok(())))).count();
    assert_eq!(winners, 1);
    assert_eq!(bridge.plugins().len(), 1);
}

#[cfg(unix)]
#[tokio::test]
async fn connect_fd_adopts_a_raw_descriptor() {
    use std::os::fd::OwnedFd;

    let bridge = bridge();
    let (ours, theirs) = std::os::unix::net::UnixStream::pair().unwrap();
    theirs.set_nonblocking(true).unwrap();
    let plugin_end = tokio::net::UnixStream::from_std(theirs).unwrap();
    let plugin = Connection::open("runtime", plugin_end, Arc::new(FakePlugin { mode: Mode::Responsive }));

    let connect = tokio::spawn({
        let bridge = bridge.clone();
        async move { bridge.connect_fd("fd-plugin", OwnedFd::from(ours), Duration::from_secs(2)).await }
    });
    plugin
        .call(
            CallKind::RegisterPlugin,
            json!({"plugin_name": "fd", "plugin_idx": "05"}),
            Some(Duration::from_secs(2)),
        )
        .await
        .unwrap();
    connect.await.unwrap().unwrap();
    assert!(bridge.is_connected("fd-plugin"));
}

// ═══════════════════════════════════════════════════════════════════════
//  Runtime -> plugin calls
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn typed_calls_round_trip() {
    let bridge = bridge();
    let _plugin = connected_plugin(&bridge, "p1", Mode::Responsive, Duration::from_secs(2)).await;

    let configured = bridge.configure("p1", &ConfigureRequest::default()).await.unwrap();
    assert!(configured.events.is_set(NriEvent::CreateContainer));

    let request: CreateContainerRequest =
        serde_json::from_value(json!({"container": {"id": "c1", "name": "web"}})).unwrap();
    let created = bridge.create_container("p1", &request).await.unwrap();
    assert_eq!(created.update[0].container_id, "c1");
    assert_eq!(created.adjust.unwrap().annotations["touched-by"], "fake");

    let event = StateChangeEvent {
        event: NriEvent::PostStartContainer,
        pod: None,
        container: None,
    };
    bridge.state_change("p1", &event).await.unwrap();
}

#[tokio::test]
async fn configure_deadline_does_not_disconnect() {
    let bridge = bridge();
    let _plugin = connected_plugin(&bridge, "p1", Mode::HangOnConfigure, Duration::from_secs(2)).await;
    let mut events = bridge.events().subscribe();

    let started = Instant::now();
    let err = bridge.configure("p1", &ConfigureRequest::default()).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, NriError::Call(KernelError::DeadlineExceeded { .. })), "got {err:?}");
    assert!(elapsed >= Duration::from_millis(1900), "resolved too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "resolved too late: {elapsed:?}");
    assert!(bridge.is_connected("p1"));
    assert!(matches!(events.recv().await.unwrap().as_ref(), Event::CallFailed { kind: CallKind::Configure, .. }));
}

#[tokio::test]
async fn calls_to_unknown_plugin_fail_immediately() {
    let bridge = bridge();
    let started = Instant::now();
    let err = bridge.configure("ghost", &ConfigureRequest::default()).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn disconnect_fails_every_outstanding_call() {
    let bridge = bridge();
    let _plugin = connected_plugin(&bridge, "p1", Mode::HangOnConfigure, Duration::from_secs(30)).await;

    let calls: Vec<_> = (0..5)
        .map(|_| {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.configure("p1", &ConfigureRequest::default()).await })
        })
        .collect();
    assert!(eventually(|| bridge.plugins().first().is_some_and(|p| p.outstanding_calls == 5)).await);

    bridge.disconnect("p1").unwrap();

    for call in calls {
        let result = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("no caller may stay suspended")
            .unwrap();
        assert!(matches!(result, Err(NriError::Call(KernelError::PeerDisconnected { .. }))));
    }

    let again = bridge.disconnect("p1").unwrap_err();
    assert!(matches!(again, NriError::NotFound { .. }));
}

#[tokio::test]
async fn shutdown_disconnects_after_acknowledgement() {
    let bridge = bridge();
    let plugin = connected_plugin(&bridge, "p1", Mode::Responsive, Duration::from_secs(2)).await;

    bridge.shutdown("p1").await.unwrap();
    assert!(!bridge.is_connected("p1"));
    tokio::time::timeout(Duration::from_secs(1), plugin.closed()).await.unwrap();
}

#[tokio::test]
async fn plugin_hangup_removes_it_from_the_bridge() {
    let bridge = bridge();
    let mut events = bridge.events().subscribe();
    let plugin = connected_plugin(&bridge, "p1", Mode::Responsive, Duration::from_secs(2)).await;

    plugin.close();
    assert!(eventually(|| bridge.plugins().is_empty()).await);

    let mut saw_disconnect = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event.as_ref(), Event::PeerDisconnected { reason, .. } if reason == "connection closed") {
            saw_disconnect = true;
        }
    }
    assert!(saw_disconnect);
}

#[tokio::test]
async fn destroy_disconnects_everything() {
    let bridge = bridge();
    let _a = connected_plugin(&bridge, "a", Mode::Responsive, Duration::from_secs(2)).await;
    let _b = connected_plugin(&bridge, "b", Mode::Responsive, Duration::from_secs(2)).await;

    let mut events = bridge.events().subscribe();
    assert_eq!(bridge.destroy().await, 2);
    assert!(bridge.plugins().is_empty());

    let mut destroyed = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Event::PeerDisconnected { peer, reason, .. } = event.as_ref() {
            assert_eq!(reason, "destroy");
            destroyed.push(peer.clone());
        }
    }
    destroyed.sort();
    assert_eq!(destroyed, ["a", "b"]);
}

#[tokio::test]
async fn concurrent_connects_respect_the_plugin_limit() {
    let bridge = PluginBridge::new(Arc::new(TestRuntime), BridgeConfig::default().with_max_plugins(2));

    let attempts: Vec<_> = (0..6)
        .map(|i| spawn_plugin(&bridge, &format!("p{i}"), "fake", Mode::Responsive, Duration::from_secs(2)))
        .collect();

    let mut connected = Vec::new();
    let mut refused = 0;
    for (i, (plugin, connect)) in attempts.into_iter().enumerate() {
        match connect.await.unwrap() {
            Ok(()) => connected.push((format!("p{i}"), plugin)),
            Err(NriError::LimitReached { limit }) => {
                assert_eq!(limit, 2);
                refused += 1;
            }
            Err(other) => panic!("unexpected connect failure: {other:?}"),
        }
    }
    assert_eq!(connected.len(), 2);
    assert_eq!(refused, 4);
    assert_eq!(bridge.plugins().len(), 2);

    // A disconnect frees its slot for the next plugin.
    bridge.disconnect(&connected[0].0).unwrap();
    let _late = connected_plugin(&bridge, "late", Mode::Responsive, Duration::from_secs(2)).await;
    assert_eq!(bridge.plugins().len(), 2);
}

#[tokio::test]
async fn hangup_frees_the_plugin_slot() {
    let bridge = PluginBridge::new(Arc::new(TestRuntime), BridgeConfig::default().with_max_plugins(1));
    let plugin = connected_plugin(&bridge, "p1", Mode::Responsive, Duration::from_secs(2)).await;

    plugin.close();
    assert!(eventually(|| bridge.plugins().is_empty()).await);
    let _next = connected_plugin(&bridge, "p2", Mode::Responsive, Duration::from_secs(2)).await;
    assert!(bridge.is_connected("p2"));
}

// ═══════════════════════════════════════════════════════════════════════
//  Plugin -> runtime calls
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn concurrent_update_containers_get_their_own_answers() {
    let bridge = bridge();
    let plugin = connected_plugin(&bridge, "p1", Mode::Responsive, Duration::from_secs(2)).await;

    let request = |id: &str| {
        serde_json::to_value(UpdateContainersRequest {
            update: vec![ContainerUpdate {
                container_id: id.to_string(),
                ..Default::default()
            }],
            evict: vec![],
        })
        .unwrap()
    };

    // The slow request is answered after the fast one.
    let slow = plugin.call(CallKind::UpdateContainers, request("slow-1"), Some(Duration::from_secs(2)));
    let fast = plugin.call(CallKind::UpdateContainers, request("fast-1"), Some(Duration::from_secs(2)));
    let (slow, fast) = tokio::join!(slow, fast);

    let slow: UpdateContainersResponse = serde_json::from_value(slow.unwrap()).unwrap();
    let fast: UpdateContainersResponse = serde_json::from_value(fast.unwrap()).unwrap();
    assert_eq!(slow.failed[0].container_id, "slow-1");
    assert_eq!(fast.failed[0].container_id, "fast-1");
}
