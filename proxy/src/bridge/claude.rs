//! Anthropic messages dialect (`/v1/messages`)

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

    let mut messages = Vec::new();
    let system = match body.get("system") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => text_of_blocks(blocks),
        _ => String::new(),
    };
    if !system.is_empty() {
        messages.push(Message::text(Role::System, system));
    }

    for raw in raw_messages {
        let role_name = raw
            .get("role")
            .and_then(|r| r.as_str())
            .ok_or(DecodeError::Missing("messages[].role"))?;
        let role = match role_name {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => return Err(DecodeError::Invalid(format!("unknown role '{}'", other))),
        };
        match raw.get("content") {
            Some(Value::String(s)) => messages.push(Message::text(role, s.as_str())),
            Some(Value::Array(blocks)) => decode_blocks(role, blocks, &mut messages),
            _ => messages.push(Message::text(role, "")),
        }
    }

    Ok(ChatRequest {
        model,
        messages,
        tools: decode_tools(body.get("tools")),
        stream: body.get("stream").and_then(|s| s.as_bool()).unwrap_or(false),
        temperature: body.get("temperature").and_then(|t| t.as_f64()),
        max_tokens: body.get("max_tokens").and_then(|m| m.as_u64()),
    })
}

/// Tool results become their own messages, ahead of any text in the turn
fn decode_blocks(role: Role, blocks: &[Value], messages: &mut Vec<Message>) {
    let mut parts = Vec::new();
    let mut calls = Vec::new();

    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                    parts.push(ContentPart::Text(text.to_string()));
                }
            }
            Some("image") => {
                if let Some(url) = image_url(block.get("source")) {
                    parts.push(ContentPart::Image(url));
                }
            }
            Some("tool_use") => {
                let Some(name) = block.get("name").and_then(|n| n.as_str()) else {
                    continue;
                };
                calls.push(ToolCall {
                    id: block
                        .get("id")
                        .and_then(|i| i.as_str())
                        .map(str::to_owned)
                        .unwrap_or_else(new_call_id),
                    name: name.to_string(),
                    arguments: block
                        .get("input")
                        .map(|i| i.to_string())
                        .unwrap_or_else(|| "{}".to_string()),
                });
            }
            Some("tool_result") => {
                let output = match block.get("content") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Array(inner)) => text_of_blocks(inner),
                    _ => String::new(),
                };
                messages.push(Message {
                    role: Role::Tool,
                    content: MessageContent::Text(output),
                    tool_call_id: block
                        .get("tool_use_id")
                        .and_then(|i| i.as_str())
                        .map(str::to_owned),
                    ..Default::default()
                });
            }
            // Thinking blocks from earlier turns are not sent back upstream
            _ => {}
        }
    }

    if parts.is_empty() && calls.is_empty() {
        return;
    }
    let content = match parts.as_slice() {
        [ContentPart::Text(t)] => MessageContent::Text(t.clone()),
        _ => MessageContent::Parts(parts),
    };
    messages.push(Message {
        role,
        content,
        tool_calls: calls,
        ..Default::default()
    });
}

fn image_url(source: Option<&Value>) -> Option<String> {
    let source = source?;
    match source.get("type").and_then(|t| t.as_str())? {
        "base64" => Some(format!(
            "data:{};base64,{}",
            source.get("media_type")?.as_str()?,
            source.get("data")?.as_str()?
        )),
        "url" => source.get("url")?.as_str().map(str::to_owned),
        _ => None,
    }
}

fn text_of_blocks(blocks: &[Value]) -> String {
    blocks
        .iter()
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_tools(raw: Option<&Value>) -> Vec<ToolSpec> {
    raw.and_then(|t| t.as_array())
        .map(|tools| {
            tools
                .iter()
                .filter_map(|tool| {
                    Some(ToolSpec {
                        name: tool.get("name")?.as_str()?.to_string(),
                        description: tool
                            .get("description")
                            .and_then(|d| d.as_str())
                            .map(str::to_owned),
                        parameters: tool
                            .get("input_schema")
                            .cloned()
                            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn stop_reason(reason: &FinishReason) -> &'static str {
    match reason {
        FinishReason::ToolCalls => "tool_use",
        FinishReason::Length => "max_tokens",
        _ => "end_turn",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    Thinking,
    Text,
}

/// Streaming encoder for `message_*` / `content_block_*` events
#[derive(Debug)]
pub struct ClaudeEncoder {
    id: String,
    model: String,
    /// Index the next content block gets
    next_index: usize,
    open: Option<Block>,
}

impl ClaudeEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            next_index: 0,
            open: None,
        }
    }

    pub fn start(&mut self) -> Vec<SseEvent> {
        vec![event(
            "message_start",
            json!({"message": {
                "id": self.id,
                "type": "message",
                "role": "assistant",
                "model": self.model,
                "content": [],
                "stop_reason": null,
                "stop_sequence": null,
                "usage": {"input_tokens": 0, "output_tokens": 0},
            }}),
        )]
    }

    pub fn reason(&mut self, text: &str) -> Vec<SseEvent> {
        let mut out = self.ensure_open(Block::Thinking);
        out.push(event(
            "content_block_delta",
            json!({"index": self.current(), "delta": {"type": "thinking_delta", "thinking": text}}),
        ));
        out
    }

    pub fn content(&mut self, text: &str) -> Vec<SseEvent> {
        let mut out = self.ensure_open(Block::Text);
        out.push(event(
            "content_block_delta",
            json!({"index": self.current(), "delta": {"type": "text_delta", "text": text}}),
        ));
        out
    }

    pub fn function_call(&mut self, call: &ToolCall) -> Vec<SseEvent> {
        let mut out = self.close_open();
        let index = self.next_index;
        self.next_index += 1;
        out.push(event(
            "content_block_start",
            json!({"index": index, "content_block": {
                "type": "tool_use", "id": call.id, "name": call.name, "input": {},
            }}),
        ));
        out.push(event(
            "content_block_delta",
            json!({"index": index, "delta": {
                "type": "input_json_delta",
                "partial_json": call.arguments_json().to_string(),
            }}),
        ));
        out.push(event("content_block_stop", json!({ "index": index })));
        out
    }

    pub fn finish(&mut self, reason: &FinishReason, usage: Option<Usage>) -> Vec<SseEvent> {
        let mut out = self.close_open();
        let usage = usage.unwrap_or_default();
        out.push(event(
            "message_delta",
            json!({
                "delta": {"stop_reason": stop_reason(reason), "stop_sequence": null},
                "usage": {
                    "input_tokens": usage.prompt_tokens,
                    "output_tokens": usage.completion_tokens,
                },
            }),
        ));
        out.push(event("message_stop", json!({})));
        out
    }

    pub fn error(&mut self, message: &str) -> Vec<SseEvent> {
        let mut out = self.close_open();
        out.push(event(
            "error",
            json!({"error": {"type": "internal_error", "message": message}}),
        ));
        out
    }

    fn current(&self) -> usize {
        self.next_index.saturating_sub(1)
    }

    fn ensure_open(&mut self, block: Block) -> Vec<SseEvent> {
        if self.open == Some(block) {
            return Vec::new();
        }
        let mut out = self.close_open();
        let index = self.next_index;
        self.next_index += 1;
        let content_block = match block {
            Block::Thinking => json!({"type": "thinking", "thinking": ""}),
            Block::Text => json!({"type": "text", "text": ""}),
        };
        out.push(event(
            "content_block_start",
            json!({"index": index, "content_block": content_block}),
        ));
        self.open = Some(block);
        out
    }

    fn close_open(&mut self) -> Vec<SseEvent> {
        if self.open.take().is_none() {
            return Vec::new();
        }
        vec![event("content_block_stop", json!({ "index": self.current() }))]
    }
}

fn event(name: &str, mut data: Value) -> SseEvent {
    data["type"] = json!(name);
    SseEvent::named(name, data.to_string())
}

/// Non-streaming `message` body
pub fn render_full(model: &str, transcript: &Transcript) -> Value {
    let mut content = Vec::new();
    if !transcript.reasoning.is_empty() {
        content.push(json!({"type": "thinking", "thinking": transcript.reasoning}));
    }
    if !transcript.content.is_empty() {
        content.push(json!({"type": "text", "text": transcript.content}));
    }
    for call in &transcript.calls {
        content.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": call.arguments_json(),
        }));
    }
    let usage = transcript.usage.unwrap_or_default();
    json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": stop_reason(&transcript.finish_reason()),
        "stop_sequence": null,
        "usage": {
            "input_tokens": usage.prompt_tokens,
            "output_tokens": usage.completion_tokens,
        },
    })
}

pub fn error_body(kind: &str, message: &str) -> Value {
    json!({"type": "error", "error": {"type": kind, "message": message}})
}
