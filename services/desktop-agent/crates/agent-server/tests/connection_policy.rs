//! Protocol tolerance, rate and connection limits, and the health probe.

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{Client, TestServer, test_config};
use desktop_agent_common::AgentServerConfig;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

// ── protocol ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn ping_gets_pong_with_timestamp() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.client().await;

    client.send(json!({"type": "ping"})).await;
    let pong = client.recv().await;
    assert_eq!(pong["type"], "pong");
    let stamp = pong["timestamp"].as_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());
}

#[tokio::test]
async fn unknown_fields_are_ignored() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.client().await;

    client
        .send(json!({
            "type": "execute_tool",
            "tool": "greeter",
            "target": "example.com",
            "user_id": "u-1",
            "tier": "elite",
        }))
        .await;
    assert_eq!(client.recv().await["type"], "start");
    let (_, complete) = client.recv_until("complete").await;
    assert_eq!(complete["success"], true);
}

#[tokio::test]
async fn unknown_type_is_rejected_and_connection_survives() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.client().await;

    client.send(json!({"type": "install_tool", "tool": "nmap"})).await;
    assert_eq!(client.recv().await["reason"], "unknown_message_type");

    client.send(json!({"type": "ping"})).await;
    assert_eq!(client.recv().await["type"], "pong");
}

#[tokio::test]
async fn malformed_messages_do_not_close_the_connection() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.client().await;

    for bad in [
        "{not json",
        r#"{"tool":"greeter"}"#,
        r#"{"type":"execute_tool","tool":"greeter"}"#,
        "[]",
    ] {
        client.send_text(bad).await;
        let error: Value = client.recv().await;
        assert_eq!(error["type"], "error", "for {bad}");
        assert_eq!(error["reason"], "malformed_message", "for {bad}");
    }

    client.send_binary(vec![0xc3, 0x28]).await;
    assert_eq!(client.recv().await["reason"], "malformed_message");

    client.send(json!({"type": "ping"})).await;
    assert_eq!(client.recv().await["type"], "pong");
}

#[tokio::test]
async fn utf8_binary_frames_are_accepted() {
    let server = TestServer::start(test_config()).await;
    let mut client = server.client().await;

    client.send_binary(br#"{"type":"ping"}"#.to_vec()).await;
    assert_eq!(client.recv().await["type"], "pong");
}

// ── limits ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn rate_limit_rejects_excess_messages() {
    let server = TestServer::start(AgentServerConfig {
        rate_limit_requests: 3,
        ..test_config()
    })
    .await;
    let mut client = server.client().await;

    for _ in 0..3 {
        client.send(json!({"type": "ping"})).await;
        assert_eq!(client.recv().await["type"], "pong");
    }
    client.execute("greeter", "example.com").await;
    let error = client.recv().await;
    assert_eq!(error["reason"], "rate_limited");
    assert_eq!(server.state.runner.spawn_count(), 0);
}

#[tokio::test]
async fn rate_limit_is_per_connection() {
    let server = TestServer::start(AgentServerConfig {
        rate_limit_requests: 1,
        ..test_config()
    })
    .await;
    let mut first = server.client().await;
    let mut second = server.client().await;

    first.send(json!({"type": "ping"})).await;
    assert_eq!(first.recv().await["type"], "pong");
    first.send(json!({"type": "ping"})).await;
    assert_eq!(first.recv().await["reason"], "rate_limited");

    second.send(json!({"type": "ping"})).await;
    assert_eq!(second.recv().await["type"], "pong");
}

#[tokio::test]
async fn connection_limit_closes_with_try_again_later() {
    let server = TestServer::start(AgentServerConfig {
        max_connections: 1,
        ..test_config()
    })
    .await;
    let first = server.client().await;

    let mut rejected = Client::connect(&server.url()).await;
    let frame = rejected.recv_close().await.expect("close frame");
    assert_eq!(u16::from(frame.code), 1013);

    // The slot frees up once the first client leaves.
    first.close().await;
    server.wait_for_no_connections().await;
    let _again = server.client().await;
}

#[tokio::test]
async fn unresponsive_client_is_dropped_by_keepalive() {
    let server = TestServer::start(AgentServerConfig {
        ping_interval_secs: 1,
        ping_timeout_secs: 1,
        ..test_config()
    })
    .await;
    // Never polled after the welcome, so the server's pings go unanswered.
    let _silent = server.client().await;
    assert_eq!(server.state.connection_count().await, 1);

    server.wait_for_no_connections().await;
}

// ── health ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_ok() {
    let server = TestServer::start(test_config()).await;
    let _client = server.client().await;

    let response = desktop_agent::router(server.state.clone())
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"], 1);
    assert_eq!(health["active_scans"], 0);
    assert_eq!(health["tools"], 7);
}

#[tokio::test]
async fn unknown_paths_are_not_found() {
    let server = TestServer::start(test_config()).await;
    let response = desktop_agent::router(server.state.clone())
        .oneshot(Request::get("/admin").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
