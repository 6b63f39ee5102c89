//! Integration tests for the extbridge-kernel crate.
//!
//! These tests drive a `Connection` against a hand-rolled peer speaking raw
//! frames, and exercise the registry and correlator together.

use std::sync::Arc;
use std::time::Duration;

use extbridge_kernel::frame::{read_frame, write_frame};
use extbridge_kernel::{
    CallKind, Connection, ConnectionRegistry, ErrorCode, Frame, KernelError, NoInbound,
};
use serde_json::json;
use tokio::io::DuplexStream;

fn open(peer: &str) -> (Connection, DuplexStream) {
    let (near, far) = tokio::io::duplex(64 * 1024);
    (Connection::open(peer, near, Arc::new(NoInbound)), far)
}

async fn next_request(far: &mut DuplexStream) -> (u64, CallKind, serde_json::Value) {
    match read_frame(far).await.unwrap() {
        Some(Frame::Request { id, kind, payload }) => (id, kind, payload),
        other => panic!("expected request, got {other:?}"),
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Correlation
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn responses_in_reverse_order_reach_their_callers() {
    let (conn, mut far) = open("p1");

    let first = {
        let conn = conn.clone();
        tokio::spawn(async move {
            conn.call(CallKind::UpdateContainers, json!({"tag": "first"}), Some(Duration::from_secs(2)))
                .await
        })
    };
    let (id_a, _, payload_a) = next_request(&mut far).await;

    let second = {
        let conn = conn.clone();
        tokio::spawn(async move {
            conn.call(CallKind::UpdateContainers, json!({"tag": "second"}), Some(Duration::from_secs(2)))
                .await
        })
    };
    let (id_b, _, payload_b) = next_request(&mut far).await;
    assert_ne!(id_a, id_b);

    // Answer the second request first.
    write_frame(&mut far, &Frame::Response { id: id_b, payload: json!({"echo": payload_b["tag"]}) })
        .await
        .unwrap();
    write_frame(&mut far, &Frame::Response { id: id_a, payload: json!({"echo": payload_a["tag"]}) })
        .await
        .unwrap();

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first["echo"], "first");
    assert_eq!(second["echo"], "second");
}

#[tokio::test]
async fn remote_error_reason_is_verbatim() {
    let (conn, mut far) = open("p1");

    let call = tokio::spawn({
        let conn = conn.clone();
        async move { conn.call(CallKind::StopContainer, json!({}), Some(Duration::from_secs(2))).await }
    });
    let (id, kind, _) = next_request(&mut far).await;
    assert_eq!(kind, CallKind::StopContainer);
    write_frame(
        &mut far,
        &Frame::Error { id, code: ErrorCode::Internal, reason: "container c1 is wedged".into() },
    )
    .await
    .unwrap();

    match call.await.unwrap() {
        Err(KernelError::RemoteError { code, reason }) => {
            assert_eq!(code, ErrorCode::Internal);
            assert_eq!(reason, "container c1 is wedged");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn deadline_sends_cancel_and_keeps_connection() {
    let (conn, mut far) = open("p1");

    let started = tokio::time::Instant::now();
    let call = tokio::spawn({
        let conn = conn.clone();
        async move { conn.call(CallKind::Configure, json!({}), Some(Duration::from_millis(200))).await }
    });
    let (id, _, _) = next_request(&mut far).await;

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, KernelError::DeadlineExceeded { kind: CallKind::Configure, .. }));
    assert!(started.elapsed() < Duration::from_secs(1));

    // The peer is told, and the connection stays usable.
    assert_eq!(read_frame(&mut far).await.unwrap(), Some(Frame::Cancel { id }));
    assert!(!conn.is_closed());

    // A late answer is dropped without disturbing later calls.
    write_frame(&mut far, &Frame::Response { id, payload: json!({}) }).await.unwrap();
    let next = tokio::spawn({
        let conn = conn.clone();
        async move { conn.call(CallKind::Synchronize, json!({}), Some(Duration::from_secs(2))).await }
    });
    let (id2, _, _) = next_request(&mut far).await;
    write_frame(&mut far, &Frame::Response { id: id2, payload: json!({"ok": true}) }).await.unwrap();
    assert_eq!(next.await.unwrap().unwrap()["ok"], true);
}

// ═══════════════════════════════════════════════════════════════════════
//  Disconnect handling
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn unregister_fails_all_outstanding_calls() {
    let registry = ConnectionRegistry::new();
    let (conn, mut far) = open("p1");
    registry.register("p1", conn.clone()).unwrap();

    let calls: Vec<_> = (0..8)
        .map(|_| {
            let conn = conn.clone();
            tokio::spawn(async move { conn.call(CallKind::UpdateContainer, json!({}), None).await })
        })
        .collect();
    for _ in 0..8 {
        next_request(&mut far).await;
    }
    assert_eq!(conn.outstanding_calls(), 8);

    registry.unregister("p1").unwrap();

    for call in calls {
        let result = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("no caller may stay suspended")
            .unwrap();
        assert!(matches!(result, Err(KernelError::PeerDisconnected { .. })));
    }
}

#[tokio::test]
async fn peer_hangup_fails_calls_on_that_connection_only() {
    let (a, far_a) = open("a");
    let (b, mut far_b) = open("b");

    let call_a = tokio::spawn({
        let a = a.clone();
        async move { a.call(CallKind::Configure, json!({}), None).await }
    });
    let call_b = tokio::spawn({
        let b = b.clone();
        async move { b.call(CallKind::Configure, json!({}), Some(Duration::from_secs(2))).await }
    });

    drop(far_a);
    let err = call_a.await.unwrap().unwrap_err();
    assert!(matches!(err, KernelError::PeerDisconnected { .. }));

    let (id, _, _) = next_request(&mut far_b).await;
    write_frame(&mut far_b, &Frame::Response { id, payload: json!({"fine": true}) }).await.unwrap();
    assert_eq!(call_b.await.unwrap().unwrap()["fine"], true);
    assert!(a.is_closed());
    assert!(!b.is_closed());
}

// ═══════════════════════════════════════════════════════════════════════
//  Registry concurrency
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_register_has_one_winner() {
    let registry = ConnectionRegistry::new();
    let mut fars = Vec::new();
    let mut tasks = Vec::new();

    for _ in 0..16 {
        let (conn, far) = open("p1");
        fars.push(far);
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move { registry.register("p1", conn).is_ok() }));
    }

    let winners = futures::future::join_all(tasks)
        .await
        .into_iter()
        .filter(|r| *r.as_ref().unwrap())
        .count();
    assert_eq!(winners, 1);
    assert_eq!(registry.count(), 1);
}

#[tokio::test]
async fn register_after_unregister_succeeds() {
    let registry = ConnectionRegistry::new();
    let (first, _f1) = open("p1");
    let (second, _f2) = open("p1");

    registry.register("p1", first).unwrap();
    registry.unregister("p1").unwrap();
    registry.register("p1", second).unwrap();
    assert_eq!(registry.count(), 1);
}
