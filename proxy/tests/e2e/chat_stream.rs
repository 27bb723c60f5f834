//! E2E test: chat dialect streaming and the tool loop

use std::sync::Arc;

use serde_json::{json, Value};

use editor_proxy::mcp::RegisteredTool;

use super::harness::{
    config_for, failing_upstream, fake_upstream, sse, start_proxy, start_proxy_with, CannedInvoker, Client,
    FailingInvoker,
};

fn content_of(events: &[String]) -> String {
    events
        .iter()
        .filter_map(|e| serde_json::from_str::<Value>(e).ok())
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str().map(str::to_string))
        .collect()
}

#[tokio::test]
async fn test_streamed_reply_is_reencoded() {
    let reply = sse(&[
        json!({"choices": [{"delta": {"role": "assistant", "content": "Hel"}}]}),
        json!({"choices": [{"delta": {"content": "lo!"}, "finish_reason": "stop"}]}),
    ]);
    let (upstream, mut bodies) = fake_upstream(vec![reply]).await;
    let proxy = start_proxy(&config_for(upstream)).await;

    let mut client = Client::connect(proxy.addr).await;
    let response = client
        .post_json(
            "/v1/chat/completion",
            &[],
            &json!({
                "model": "qwen3",
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}]
            }),
        )
        .await;

    assert_eq!(response.status, 200);
    assert_eq!(response.header("Content-Type"), Some("text/event-stream"));

    let events = response.events();
    assert_eq!(events.last().map(String::as_str), Some("[DONE]"));
    assert_eq!(content_of(&events), "Hello!");

    let finish: Value = serde_json::from_str(&events[events.len() - 2]).expect("finish chunk");
    assert_eq!(finish["choices"][0]["finish_reason"], "stop");
    assert_eq!(finish["model"], "qwen3");

    let sent = bodies.recv().await.expect("upstream saw the request");
    assert_eq!(sent["model"], "qwen3");
    assert_eq!(sent["stream"], true);
}

#[tokio::test]
async fn test_missing_model_is_rejected() {
    let (upstream, _bodies) = fake_upstream(Vec::new()).await;
    let proxy = start_proxy(&config_for(upstream)).await;

    let mut client = Client::connect(proxy.addr).await;
    let response = client
        .post_json(
            "/v1/chat/completions",
            &[],
            &json!({"messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;

    assert_eq!(response.status, 400);
    assert_eq!(response.json()["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn test_registry_tool_round_trip() {
    let first = sse(&[json!({"choices": [{
        "delta": {"tool_calls": [{
            "index": 0,
            "id": "call_1",
            "type": "function",
            "function": {"name": "files_read", "arguments": "{\"path\":\"a.txt\"}"}
        }]},
        "finish_reason": "tool_calls"
    }]})]);
    let second = sse(&[json!({"choices": [{"delta": {"content": "Done."}, "finish_reason": "stop"}]})]);
    let (upstream, mut bodies) = fake_upstream(vec![first, second]).await;

    let proxy = start_proxy_with(&config_for(upstream), Arc::new(CannedInvoker("file contents"))).await;
    proxy
        .ctx
        .registry
        .add(RegisteredTool::new("files", "read", Some("Read a file".into()), None));

    let mut client = Client::connect(proxy.addr).await;
    let response = client
        .post_json(
            "/v1/chat/completions",
            &[],
            &json!({
                "model": "qwen3",
                "stream": false,
                "messages": [{"role": "user", "content": "read a.txt"}]
            }),
        )
        .await;

    assert_eq!(response.status, 200);
    let body = response.json();
    assert_eq!(body["choices"][0]["message"]["content"], "Done.");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");

    let round_one = bodies.recv().await.expect("first upstream call");
    assert_eq!(round_one["tools"][0]["function"]["name"], "files_read");

    let round_two = bodies.recv().await.expect("second upstream call");
    let messages = round_two["messages"].as_array().expect("messages");
    let tool_message = messages
        .iter()
        .find(|m| m["role"] == "tool")
        .expect("tool result folded into the conversation");
    assert!(tool_message.to_string().contains("file contents"));
}

#[tokio::test]
async fn test_upstream_status_error_ends_stream() {
    let (upstream, _bodies) = failing_upstream(500, "model crashed").await;
    let proxy = start_proxy(&config_for(upstream)).await;

    let mut client = Client::connect(proxy.addr).await;
    let response = client
        .post_json(
            "/v1/chat/completions",
            &[],
            &json!({
                "model": "qwen3",
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}]
            }),
        )
        .await;

    assert_eq!(response.status, 200);
    let events = response.events();
    assert_eq!(events.last().map(String::as_str), Some("[DONE]"));
    let error: Value = serde_json::from_str(&events[events.len() - 2]).expect("error chunk");
    assert_eq!(error["error"]["type"], "internal_error");
    assert!(error["error"]["message"].as_str().unwrap().contains("500"));

    // Connection stays usable after the failed turn
    client.send("GET", "/v1/models", &[], "").await;
    assert_eq!(client.response().await.status, 200);
}

#[tokio::test]
async fn test_upstream_error_mid_stream_keeps_partial_content() {
    let reply = format!(
        "data: {}\n\ndata: {}\n\n",
        json!({"choices": [{"delta": {"content": "Hel"}}]}),
        json!({"error": {"message": "overloaded"}})
    );
    let (upstream, _bodies) = fake_upstream(vec![reply]).await;
    let proxy = start_proxy(&config_for(upstream)).await;

    let mut client = Client::connect(proxy.addr).await;
    let response = client
        .post_json(
            "/v1/chat/completions",
            &[],
            &json!({
                "model": "qwen3",
                "stream": true,
                "messages": [{"role": "user", "content": "hi"}]
            }),
        )
        .await;

    let events = response.events();
    assert_eq!(content_of(&events), "Hel");
    assert_eq!(events.last().map(String::as_str), Some("[DONE]"));
    let error: Value = serde_json::from_str(&events[events.len() - 2]).expect("error chunk");
    assert_eq!(error["error"]["type"], "internal_error");
    assert!(error["error"]["message"].as_str().unwrap().contains("overloaded"));
}

#[tokio::test]
async fn test_upstream_error_without_stream_is_502() {
    let (upstream, _bodies) = failing_upstream(503, "no capacity").await;
    let proxy = start_proxy(&config_for(upstream)).await;

    let mut client = Client::connect(proxy.addr).await;
    let response = client
        .post_json(
            "/v1/chat/completions",
            &[],
            &json!({
                "model": "qwen3",
                "stream": false,
                "messages": [{"role": "user", "content": "hi"}]
            }),
        )
        .await;

    assert_eq!(response.status, 502);
    assert_eq!(response.json()["error"]["type"], "internal_error");
}

#[tokio::test]
async fn test_failed_tool_call_is_reported_and_loop_continues() {
    let first = sse(&[json!({"choices": [{
        "delta": {"tool_calls": [{
            "index": 0,
            "id": "call_1",
            "type": "function",
            "function": {"name": "files_read", "arguments": "{\"path\":\"gone.txt\"}"}
        }]},
        "finish_reason": "tool_calls"
    }]})]);
    let second = sse(&[json!({"choices": [{"delta": {"content": "File is missing."}, "finish_reason": "stop"}]})]);
    let (upstream, mut bodies) = fake_upstream(vec![first, second]).await;

    let proxy = start_proxy_with(&config_for(upstream), Arc::new(FailingInvoker("no such file"))).await;
    proxy
        .ctx
        .registry
        .add(RegisteredTool::new("files", "read", Some("Read a file".into()), None));

    let mut client = Client::connect(proxy.addr).await;
    let response = client
        .post_json(
            "/v1/chat/completions",
            &[],
            &json!({
                "model": "qwen3",
                "stream": false,
                "messages": [{"role": "user", "content": "read gone.txt"}]
            }),
        )
        .await;

    assert_eq!(response.status, 200);
    let body = response.json();
    let content = body["choices"][0]["message"]["content"].as_str().expect("content");
    assert!(content.contains("status=\"failed\""));
    assert!(content.ends_with("File is missing."));
    assert_eq!(body["choices"][0]["finish_reason"], "stop");

    let _round_one = bodies.recv().await.expect("first upstream call");
    let round_two = bodies.recv().await.expect("second upstream call");
    let tool_message = round_two["messages"]
        .as_array()
        .expect("messages")
        .iter()
        .find(|m| m["role"] == "tool")
        .expect("failure folded into the conversation")
        .to_string();
    assert!(tool_message.contains("no such file"));
}
