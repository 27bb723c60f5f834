//! E2E test: several requests on one connection

use super::harness::{start_proxy, Client};

const TWO_MODELS: &str = r#"
[[providers]]
name = "local"
base_url = "http://127.0.0.1:9/v1"
models = ["qwen3", "llama"]
"#;

#[tokio::test]
async fn test_sequential_requests_share_connection() {
    let proxy = start_proxy(TWO_MODELS).await;
    let mut client = Client::connect(proxy.addr).await;

    client.send("GET", "/v1/models", &[], "").await;
    let first = client.response().await;
    assert_eq!(first.status, 200);
    assert_eq!(first.json()["data"][0]["id"], "qwen3");

    client.send("GET", "/v1/models", &[], "").await;
    let second = client.response().await;
    assert_eq!(second.status, 200);
    assert_eq!(second.json()["data"][1]["id"], "llama");
}

#[tokio::test]
async fn test_pipelined_requests_answered_in_order() {
    let proxy = start_proxy(TWO_MODELS).await;
    let mut client = Client::connect(proxy.addr).await;

    let ping = r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#;
    let raw = format!(
        "GET /v1/models HTTP/1.1\r\nHost: localhost\r\n\r\n\
         POST /mcp HTTP/1.1\r\nHost: localhost\r\nContent-Length: {}\r\n\r\n{}",
        ping.len(),
        ping
    );
    tokio::io::AsyncWriteExt::write_all(&mut client.stream, raw.as_bytes())
        .await
        .expect("write pipelined requests");

    let models = client.response().await;
    assert_eq!(models.json()["object"], "list");
    let pong = client.response().await;
    assert_eq!(pong.json()["id"], 7);
}

#[tokio::test]
async fn test_connection_close_is_honoured() {
    let proxy = start_proxy(TWO_MODELS).await;
    let mut client = Client::connect(proxy.addr).await;

    client
        .send("GET", "/v1/models", &[("Connection", "close")], "")
        .await;
    let response = client.response().await;
    assert_eq!(response.status, 200);
    assert!(client.closed().await);
}

#[tokio::test]
async fn test_preflight_and_wrong_method() {
    let proxy = start_proxy(TWO_MODELS).await;
    let mut client = Client::connect(proxy.addr).await;

    client.send("OPTIONS", "/v1/chat/completions", &[], "").await;
    let preflight = client.response().await;
    assert_eq!(preflight.status, 204);
    assert_eq!(preflight.header("Access-Control-Allow-Origin"), Some("*"));

    client.send("GET", "/v1/chat/completions", &[], "").await;
    let wrong = client.response().await;
    assert_eq!(wrong.status, 405);
}

#[tokio::test]
async fn test_oversized_chunk_gets_413_and_close() {
    let proxy = start_proxy(TWO_MODELS).await;
    let mut client = Client::connect(proxy.addr).await;

    let raw = "POST /mcp HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nabc";
    tokio::io::AsyncWriteExt::write_all(&mut client.stream, raw.as_bytes())
        .await
        .expect("write oversized chunk");

    let response = client.response().await;
    assert_eq!(response.status, 413);
    assert_eq!(response.header("Connection"), Some("close"));
    assert!(client.closed().await);
}
