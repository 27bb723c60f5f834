//! OpenAI chat-completions dialect (`/v1/chat/completions`)

use chrono::Utc;
use serde_json::{json, Value};

use super::{DecodeError, Transcript};
use crate::http::SseEvent;
use crate::llm::{
    new_call_id, ChatRequest, ContentPart, FinishReason, Message, MessageContent, Role, ToolCall,
    ToolSpec, Usage,
};

pub fn decode(body: &Value) -> Result<ChatRequest, DecodeError> {
    let model = body
        .get("model")
        .and_then(|m| m.as_str())
        .ok_or(DecodeError::Missing("model"))?
        .to_string();
    let raw_messages = body
        .get("messages")
        .and_then(|m| m.as_array())
        .ok_or(DecodeError::Missing("messages"))?;

    let mut messages = Vec::with_capacity(raw_messages.len());
    for raw in raw_messages {
        messages.push(decode_message(raw)?);
    }

    Ok(ChatRequest {
        model,
        messages,
        tools: decode_tools(body.get("tools")),
        stream: body.get("stream").and_then(|s| s.as_bool()).unwrap_or(false),
        temperature: body.get("temperature").and_then(|t| t.as_f64()),
        max_tokens: body
            .get("max_completion_tokens")
            .or_else(|| body.get("max_tokens"))
            .and_then(|m| m.as_u64()),
    })
}

fn decode_message(raw: &Value) -> Result<Message, DecodeError> {
    let role_name = raw
        .get("role")
        .and_then(|r| r.as_str())
        .ok_or(DecodeError::Missing("messages[].role"))?;
    let role = Role::parse(role_name).ok_or_else(|| DecodeError::Invalid(format!("unknown role '{}'", role_name)))?;

    let tool_calls = raw
        .get("tool_calls")
        .and_then(|c| c.as_array())
        .map(|calls| calls.iter().filter_map(decode_call).collect())
        .unwrap_or_default();

    Ok(Message {
        role,
        content: decode_content(raw.get("content")),
        reasoning: None,
        tool_calls,
        tool_call_id: raw
            .get("tool_call_id")
            .and_then(|i| i.as_str())
            .map(str::to_owned),
        name: raw.get("name").and_then(|n| n.as_str()).map(str::to_owned),
    })
}

fn decode_content(raw: Option<&Value>) -> MessageContent {
    match raw {
        Some(Value::String(s)) => MessageContent::Text(s.clone()),
        Some(Value::Array(parts)) => MessageContent::Parts(
            parts
                .iter()
                .filter_map(|part| match part.get("type").and_then(|t| t.as_str()) {
                    Some("text") | Some("input_text") => part
                        .get("text")
                        .and_then(|t| t.as_str())
                        .map(|t| ContentPart::Text(t.to_string())),
                    Some("image_url") => {
                        let url = part.get("image_url")?;
                        url.get("url")
                            .and_then(|u| u.as_str())
                            .or_else(|| url.as_str())
                            .map(|u| ContentPart::Image(u.to_string()))
                    }
                    _ => None,
                })
                .collect(),
        ),
        _ => MessageContent::default(),
    }
}

fn decode_call(raw: &Value) -> Option<ToolCall> {
    let function = raw.get("function")?;
    let name = function.get("name")?.as_str()?.to_string();
    let arguments = match function.get("arguments") {
        Some(Value::String(s)) => s.clone(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => String::new(),
    };
    Some(ToolCall {
        id: raw
            .get("id")
            .and_then(|i| i.as_str())
            .map(str::to_owned)
            .unwrap_or_else(new_call_id),
        name,
        arguments,
    })
}

fn decode_tools(raw: Option<&Value>) -> Vec<ToolSpec> {
    raw.and_then(|t| t.as_array())
        .map(|tools| {
            tools
                .iter()
                .filter_map(|tool| {
                    let function = tool.get("function").unwrap_or(tool);
                    Some(ToolSpec {
                        name: function.get("name")?.as_str()?.to_string(),
                        description: function
                            .get("description")
                            .and_then(|d| d.as_str())
                            .map(str::to_owned),
                        parameters: function
                            .get("parameters")
                            .cloned()
                            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Streaming encoder for `chat.completion.chunk` events
#[derive(Debug)]
pub struct ChatEncoder {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
    call_index: usize,
}

impl ChatEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            created: Utc::now().timestamp(),
            role_sent: false,
            call_index: 0,
        }
    }

    pub fn start(&mut self) -> Vec<SseEvent> {
        Vec::new()
    }

    pub fn reason(&mut self, text: &str) -> Vec<SseEvent> {
        vec![self.delta(json!({"reasoning_content": text}), None)]
    }

    pub fn content(&mut self, text: &str) -> Vec<SseEvent> {
        vec![self.delta(json!({"content": text}), None)]
    }

    pub fn function_call(&mut self, call: &ToolCall) -> Vec<SseEvent> {
        let index = self.call_index;
        self.call_index += 1;
        vec![self.delta(
            json!({
                "tool_calls": [{
                    "index": index,
                    "id": call.id,
                    "type": "function",
                    "function": {"name": call.name, "arguments": call.arguments},
                }]
            }),
            None,
        )]
    }

    pub fn finish(&mut self, reason: &FinishReason, usage: Option<Usage>) -> Vec<SseEvent> {
        let mut chunk = self.chunk(json!({}), Some(reason.as_openai()));
        if let Some(usage) = usage {
            chunk["usage"] = json!(usage);
        }
        vec![SseEvent::data(chunk.to_string()), SseEvent::done()]
    }

    pub fn error(&mut self, message: &str) -> Vec<SseEvent> {
        vec![
            SseEvent::data(json!({"error": {"type": "internal_error", "message": message}}).to_string()),
            SseEvent::done(),
        ]
    }

    fn delta(&mut self, mut delta: Value, finish: Option<&str>) -> SseEvent {
        if !self.role_sent {
            delta["role"] = json!("assistant");
            self.role_sent = true;
        }
        SseEvent::data(self.chunk(delta, finish).to_string())
    }

    fn chunk(&self, delta: Value, finish: Option<&str>) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish,
            }],
        })
    }
}

/// Non-streaming `chat.completion` body
pub fn render_full(model: &str, transcript: &Transcript) -> Value {
    let mut message = json!({
        "role": "assistant",
        "content": transcript.content,
    });
    if !transcript.reasoning.is_empty() {
        message["reasoning_content"] = json!(transcript.reasoning);
    }
    if !transcript.calls.is_empty() {
        message["tool_calls"] = Value::Array(
            transcript
                .calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": {"name": c.name, "arguments": c.arguments},
                    })
                })
                .collect(),
        );
    }
    json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": transcript.finish_reason().as_openai(),
        }],
        "usage": transcript.usage.unwrap_or_default(),
    })
}

pub fn error_body(kind: &str, message: &str) -> Value {
    json!({"error": {"type": kind, "message": message}})
}
