//! E2E test: Responses and Messages dialects over the same upstream

use serde_json::{json, Value};

use super::harness::{config_for, fake_upstream, sse, start_proxy, Client};

/// Reasoning goes to each dialect's own reasoning field
fn field_config(upstream: std::net::SocketAddr) -> String {
    config_for(upstream).replace("[bridge]\n", "[bridge]\nthink_mode = \"field\"\n")
}

fn hello_reply() -> String {
    sse(&[
        json!({"choices": [{"delta": {"reasoning_content": "greet back"}}]}),
        json!({"choices": [{"delta": {"content": "Hel"}}]}),
        json!({"choices": [{"delta": {"content": "lo!"}, "finish_reason": "stop"}]}),
    ])
}

#[tokio::test]
async fn test_responses_stream_events() {
    let (upstream, mut bodies) = fake_upstream(vec![hello_reply()]).await;
    let proxy = start_proxy(&field_config(upstream)).await;

    let mut client = Client::connect(proxy.addr).await;
    let response = client
        .post_json(
            "/v1/responses",
            &[],
            &json!({
                "model": "qwen3",
                "stream": true,
                "instructions": "Be brief.",
                "input": [{"role": "user", "content": [{"type": "input_text", "text": "hi"}]}]
            }),
        )
        .await;

    assert_eq!(response.status, 200);
    assert_eq!(response.header("Content-Type"), Some("text/event-stream"));

    let events: Vec<Value> = response
        .events()
        .iter()
        .filter_map(|e| serde_json::from_str(e).ok())
        .collect();
    assert_eq!(events[0]["type"], "response.created");

    let text: String = events
        .iter()
        .filter(|e| e["type"] == "response.output_text.delta")
        .filter_map(|e| e["delta"].as_str())
        .collect();
    assert_eq!(text, "Hello!");
    assert!(events
        .iter()
        .any(|e| e["type"] == "response.reasoning_summary_text.delta" && e["delta"] == "greet back"));

    let completed = events
        .iter()
        .find(|e| e["type"] == "response.completed")
        .expect("completed event");
    assert_eq!(completed["response"]["status"], "completed");
    let output = completed["response"]["output"].as_array().expect("output items");
    assert_eq!(output.last().unwrap()["type"], "message");

    let sent = bodies.recv().await.expect("upstream saw the request");
    assert_eq!(sent["messages"][0]["role"], "system");
}

#[tokio::test]
async fn test_messages_full_body() {
    let (upstream, mut bodies) = fake_upstream(vec![hello_reply()]).await;
    let proxy = start_proxy(&field_config(upstream)).await;

    let mut client = Client::connect(proxy.addr).await;
    let response = client
        .post_json(
            "/v1/messages",
            &[],
            &json!({
                "model": "qwen3",
                "max_tokens": 256,
                "system": "Be brief.",
                "messages": [{"role": "user", "content": [{"type": "text", "text": "hi"}]}]
            }),
        )
        .await;

    assert_eq!(response.status, 200);
    let body = response.json();
    assert_eq!(body["type"], "message");
    assert_eq!(body["role"], "assistant");
    assert_eq!(body["model"], "qwen3");
    assert_eq!(body["stop_reason"], "end_turn");

    let content = body["content"].as_array().expect("content blocks");
    assert_eq!(content[0]["type"], "thinking");
    assert_eq!(content[0]["thinking"], "greet back");
    assert_eq!(content[1]["type"], "text");
    assert_eq!(content[1]["text"], "Hello!");

    let sent = bodies.recv().await.expect("upstream saw the request");
    assert_eq!(sent["max_tokens"], 256);
}

#[tokio::test]
async fn test_messages_missing_messages_is_rejected() {
    let (upstream, _bodies) = fake_upstream(Vec::new()).await;
    let proxy = start_proxy(&field_config(upstream)).await;

    let mut client = Client::connect(proxy.addr).await;
    let response = client
        .post_json("/v1/messages", &[], &json!({"model": "qwen3"}))
        .await;

    assert_eq!(response.status, 400);
    let body = response.json();
    assert_eq!(body["type"], "error");
    assert_eq!(body["error"]["type"], "invalid_request_error");
}
