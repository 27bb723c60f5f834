//! E2E test: MCP handshake and list_changed delivery

use std::time::Duration;

use serde_json::json;

use editor_proxy::mcp::RegisteredTool;

use super::harness::{start_proxy, Client};

const NO_PROVIDERS: &str = "[bridge]\nsse_close_grace_ms = 20\n";

/// Run initialize plus notifications/initialized; returns the session id
async fn handshake(client: &mut Client) -> String {
    let response = client
        .post_json(
            "/mcp",
            &[],
            &json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {"protocolVersion": "2025-03-26", "capabilities": {}}
            }),
        )
        .await;

    assert_eq!(response.status, 200);
    let body = response.json();
    assert_eq!(body["id"], 1);
    assert_eq!(body["result"]["protocolVersion"], "2025-03-26");
    assert_eq!(body["result"]["capabilities"]["tools"]["listChanged"], true);
    let session = response
        .header("Mcp-Session-Id")
        .expect("session id assigned")
        .to_string();

    let response = client
        .post_json(
            "/mcp",
            &[("Mcp-Session-Id", session.as_str())],
            &json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        )
        .await;
    assert_eq!(response.status, 202);
    assert!(response.body.is_empty());

    session
}

#[tokio::test]
async fn test_initialize_handshake() {
    let proxy = start_proxy(NO_PROVIDERS).await;
    let mut client = Client::connect(proxy.addr).await;

    let session = handshake(&mut client).await;
    assert!(!session.is_empty());

    let info = proxy.ctx.sessions.lookup(&session).await.expect("session exists");
    assert!(info.initialized);
}

#[tokio::test]
async fn test_tools_list_and_call() {
    let proxy = start_proxy(NO_PROVIDERS).await;
    proxy
        .ctx
        .registry
        .add(RegisteredTool::new("files", "read", Some("Read a file".into()), None));
    let mut client = Client::connect(proxy.addr).await;
    let session = handshake(&mut client).await;

    let listed = client
        .post_json(
            "/mcp",
            &[("Mcp-Session-Id", session.as_str())],
            &json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
        )
        .await
        .json();
    assert_eq!(listed["result"]["tools"][0]["name"], "files_read");

    let called = client
        .post_json(
            "/mcp",
            &[("Mcp-Session-Id", session.as_str())],
            &json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": {"name": "files_read", "arguments": {"path": "a.txt"}}
            }),
        )
        .await
        .json();
    assert_eq!(called["id"], 3);
    assert_eq!(called["result"]["content"][0]["text"], "ok");
}

#[tokio::test]
async fn test_invalid_body_gets_error_envelope() {
    let proxy = start_proxy(NO_PROVIDERS).await;
    let mut client = Client::connect(proxy.addr).await;

    client.send("POST", "/mcp", &[], "not json").await;
    let response = client.response().await;

    assert_eq!(response.status, 400);
    let body = response.json();
    assert_eq!(body["error"]["code"], -32600);
    assert!(body["id"].is_null());
}

#[tokio::test]
async fn test_registry_change_notifies_open_stream() {
    let proxy = start_proxy(NO_PROVIDERS).await;
    let mut control = Client::connect(proxy.addr).await;
    let session = handshake(&mut control).await;

    let mut stream = Client::connect(proxy.addr).await;
    stream
        .send("GET", "/mcp", &[("Mcp-Session-Id", session.as_str()), ("Accept", "text/event-stream")], "")
        .await;
    let head = stream.head().await;
    assert_eq!(head.status, 200);
    assert_eq!(head.header("Content-Type"), Some("text/event-stream"));

    proxy
        .ctx
        .registry
        .add(RegisteredTool::new("git", "status", None, None));

    let body = String::from_utf8(stream.chunked_body().await).expect("utf-8 body");
    let events: Vec<&str> = body.lines().filter_map(|l| l.strip_prefix("data: ")).collect();
    assert_eq!(events.len(), 1);
    let notice: serde_json::Value = serde_json::from_str(events[0]).expect("notice is JSON");
    assert_eq!(notice["method"], "notifications/tools/list_changed");

    assert!(stream.closed().await, "stream closes after the grace period");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(proxy.ctx.sessions.lookup(&session).await.is_none());
}

#[tokio::test]
async fn test_unknown_path_is_404() {
    let proxy = start_proxy(NO_PROVIDERS).await;
    let mut client = Client::connect(proxy.addr).await;

    client.send("GET", "/nope", &[], "").await;
    let response = client.response().await;
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn test_stream_opened_before_initialized_keeps_notices() {
    let proxy = start_proxy(NO_PROVIDERS).await;
    let mut control = Client::connect(proxy.addr).await;
    let response = control
        .post_json(
            "/mcp",
            &[],
            &json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "initialize",
                "params": {"protocolVersion": "2025-03-26", "capabilities": {}}
            }),
        )
        .await;
    let session = response
        .header("Mcp-Session-Id")
        .expect("session id assigned")
        .to_string();

    let mut stream = Client::connect(proxy.addr).await;
    stream
        .send("GET", "/mcp", &[("Mcp-Session-Id", session.as_str())], "")
        .await;
    assert_eq!(stream.head().await.status, 200);

    let response = control
        .post_json(
            "/mcp",
            &[("Mcp-Session-Id", session.as_str())],
            &json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
        )
        .await;
    assert_eq!(response.status, 202);

    let info = proxy.ctx.sessions.lookup(&session).await.expect("session exists");
    assert!(info.initialized);
    assert!(info.streaming);

    proxy
        .ctx
        .registry
        .add(RegisteredTool::new("git", "status", None, None));

    let body = String::from_utf8(stream.chunked_body().await).expect("utf-8 body");
    assert!(body.contains("notifications/tools/list_changed"));
    assert!(stream.closed().await);
}

#[tokio::test]
async fn test_stream_skips_notices_queued_before_it_opened() {
    let proxy = start_proxy(NO_PROVIDERS).await;
    let mut client = Client::connect(proxy.addr).await;
    let session = handshake(&mut client).await;

    // Lands in this connection's queue while it only serves POSTs
    proxy
        .ctx
        .registry
        .add(RegisteredTool::new("git", "status", None, None));
    tokio::time::sleep(Duration::from_millis(100)).await;

    client
        .send("GET", "/mcp", &[("Mcp-Session-Id", session.as_str())], "")
        .await;
    assert_eq!(client.head().await.status, 200);

    let early = tokio::time::timeout(Duration::from_millis(200), client.stream.peek(&mut [0u8; 16])).await;
    assert!(early.is_err(), "stale notice delivered on a fresh stream");

    proxy
        .ctx
        .registry
        .add(RegisteredTool::new("git", "log", None, None));
    let body = String::from_utf8(client.chunked_body().await).expect("utf-8 body");
    let events: Vec<&str> = body.lines().filter_map(|l| l.strip_prefix("data: ")).collect();
    assert_eq!(events.len(), 1);
}
