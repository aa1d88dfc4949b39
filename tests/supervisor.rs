//! Supervisor behaviour against the real `mcp-echo-server` process.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{echo_supervisor, settings, wait_for_pending, wait_for_state};
use mcp_hub::mcp_client::{
    ConnectionState, McpError, ServerDefinition, Supervisor, SupervisorSettings,
};

fn tool(name: &str, arguments: serde_json::Value) -> serde_json::Value {
    json!({"name": name, "arguments": arguments})
}

#[tokio::test]
async fn test_handshake_and_echo_round_trip() {
    let sup = echo_supervisor(&[]);
    sup.connect().await.unwrap();
    assert_eq!(sup.state(), ConnectionState::Connected);

    let args = json!({"text": "hi", "nested": {"n": [1, 2, 3]}});
    let result = sup
        .call("tools/call", tool("echo", args.clone()), None)
        .await
        .unwrap();
    assert_eq!(result, args);

    sup.shutdown().await.unwrap();
    assert_eq!(sup.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_out_of_order_responses_reach_their_callers() {
    let sup = echo_supervisor(&[]);
    sup.connect().await.unwrap();

    // The server answers in the order 2, 3, 1.
    let (a, b, c) = tokio::join!(
        sup.call("tools/call", tool("delay", json!({"ms": 300, "value": "first"})), None),
        sup.call("tools/call", tool("delay", json!({"ms": 50, "value": "second"})), None),
        sup.call("tools/call", tool("delay", json!({"ms": 150, "value": "third"})), None),
    );
    assert_eq!(a.unwrap(), json!({"value": "first"}));
    assert_eq!(b.unwrap(), json!({"value": "second"}));
    assert_eq!(c.unwrap(), json!({"value": "third"}));
    assert_eq!(sup.pending_calls(), 0);

    sup.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_many_concurrent_calls() {
    let sup = echo_supervisor(&[]);
    sup.connect().await.unwrap();

    let calls = (0..50).map(|i| {
        let sup = Arc::clone(&sup);
        tokio::spawn(async move {
            let result = sup
                .call("tools/call", tool("echo", json!({"i": i})), None)
                .await;
            (i, result)
        })
    });
    for handle in futures::future::join_all(calls).await {
        let (i, result) = handle.unwrap();
        assert_eq!(result.unwrap(), json!({"i": i}));
    }

    sup.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_process_exit_fails_every_outstanding_call() {
    let sup = echo_supervisor(&[]);
    sup.connect().await.unwrap();

    let silent: Vec<_> = (0..5)
        .map(|_| {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move {
                sup.call(
                    "tools/call",
                    tool("silent", json!({})),
                    Some(Duration::from_secs(30)),
                )
                .await
            })
        })
        .collect();
    assert!(wait_for_pending(&sup, 5).await);

    let crash = sup.call("tools/call", tool("crash", json!({})), None).await;
    assert!(matches!(crash, Err(McpError::ConnectionLost { .. })));

    for handle in silent {
        assert!(matches!(
            handle.await.unwrap(),
            Err(McpError::ConnectionLost { .. })
        ));
    }

    assert!(wait_for_state(&sup, ConnectionState::Disconnected).await);
    assert_eq!(sup.pending_calls(), 0);
    assert!(sup.last_error().is_some());
    assert!(matches!(
        sup.call("tools/list", json!({}), None).await,
        Err(McpError::NotConnected { .. })
    ));
}

#[tokio::test]
async fn test_timeout_then_late_reply_is_discarded() {
    let sup = echo_supervisor(&[]);
    sup.connect().await.unwrap();

    let result = sup
        .call(
            "tools/call",
            tool("delay", json!({"ms": 400, "value": "late"})),
            Some(Duration::from_millis(100)),
        )
        .await;
    match result {
        Err(McpError::Timeout {
            method, timeout_ms, ..
        }) => {
            assert_eq!(method, "tools/call");
            assert_eq!(timeout_ms, 100);
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert_eq!(sup.pending_calls(), 0);

    // Let the late reply arrive; it must not disturb anything.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(sup.state(), ConnectionState::Connected);
    let result = sup
        .call("tools/call", tool("echo", json!({"after": "timeout"})), None)
        .await
        .unwrap();
    assert_eq!(result, json!({"after": "timeout"}));

    sup.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_lines_are_skipped() {
    // --noisy prints chatter before the handshake as well.
    let sup = echo_supervisor(&["--noisy"]);
    sup.connect().await.unwrap();

    let result = sup
        .call("tools/call", tool("garbage", json!({})), None)
        .await
        .unwrap();
    assert_eq!(result, json!({"survived": true}));

    let result = sup
        .call("tools/call", tool("echo", json!({"still": "ok"})), None)
        .await
        .unwrap();
    assert_eq!(result, json!({"still": "ok"}));

    sup.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_errors_are_surfaced() {
    let sup = echo_supervisor(&[]);
    sup.connect().await.unwrap();

    match sup.call("tools/call", tool("fail", json!({})), None).await {
        Err(McpError::Remote { code, message, .. }) => {
            assert_eq!(code, -32000);
            assert!(message.contains("on purpose"));
        }
        other => panic!("expected Remote error, got {other:?}"),
    }

    match sup.call("resources/list", json!({}), None).await {
        Err(McpError::Remote { code, .. }) => assert_eq!(code, -32601),
        other => panic!("expected Remote error, got {other:?}"),
    }

    // A remote error is not a connection failure.
    assert_eq!(sup.state(), ConnectionState::Connected);
    sup.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connect_after_loss_builds_fresh_connection() {
    let sup = echo_supervisor(&[]);
    sup.connect().await.unwrap();
    let _ = sup.call("tools/call", tool("crash", json!({})), None).await;
    assert!(wait_for_state(&sup, ConnectionState::Disconnected).await);

    sup.connect().await.unwrap();
    assert_eq!(sup.state(), ConnectionState::Connected);
    assert!(sup.last_error().is_none());
    let result = sup
        .call("tools/call", tool("echo", json!({"again": true})), None)
        .await
        .unwrap();
    assert_eq!(result, json!({"again": true}));

    sup.shutdown().await.unwrap();
}

/// A live provider that never reads its stdin, so large writes stall.
#[cfg(unix)]
fn deaf_supervisor() -> Arc<Supervisor> {
    let definition = ServerDefinition::new("deaf", "sh", &["-c", "exec sleep 30"]);
    let settings = SupervisorSettings {
        handshake: false,
        ..settings()
    };
    Arc::new(Supervisor::new(Arc::new(definition), settings))
}

#[cfg(unix)]
fn big_call() -> serde_json::Value {
    tool("echo", json!({"blob": "x".repeat(1024 * 1024)}))
}

#[cfg(unix)]
#[tokio::test]
async fn test_stalled_write_still_times_out() {
    let sup = deaf_supervisor();
    sup.connect().await.unwrap();

    let started = std::time::Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(3),
        sup.call("tools/call", big_call(), Some(Duration::from_millis(200))),
    )
    .await
    .expect("call outlived its own timeout");
    assert!(matches!(result, Err(McpError::Timeout { timeout_ms: 200, .. })));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(sup.pending_calls(), 0);

    tokio::time::timeout(Duration::from_secs(3), sup.shutdown())
        .await
        .expect("shutdown hung")
        .unwrap();
    assert_eq!(sup.state(), ConnectionState::Disconnected);
}

#[cfg(unix)]
#[tokio::test]
async fn test_shutdown_completes_while_a_write_is_stalled() {
    let sup = deaf_supervisor();
    sup.connect().await.unwrap();

    let stalled = {
        let sup = Arc::clone(&sup);
        tokio::spawn(async move {
            sup.call("tools/call", big_call(), Some(Duration::from_secs(30)))
                .await
        })
    };
    assert!(wait_for_pending(&sup, 1).await);
    tokio::time::sleep(Duration::from_millis(300)).await;

    tokio::time::timeout(Duration::from_secs(3), sup.shutdown())
        .await
        .expect("shutdown hung behind a stalled write")
        .unwrap();
    assert_eq!(sup.state(), ConnectionState::Disconnected);

    let result = tokio::time::timeout(Duration::from_secs(3), stalled)
        .await
        .expect("stalled call never finished")
        .unwrap();
    assert!(matches!(result, Err(McpError::ConnectionLost { .. })));
}
