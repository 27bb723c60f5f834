//! Codex "responses" dialect (`/v1/responses`)
//!
//! Output is a list of items (reasoning, message, function_call). The
//! streaming encoder opens an item lazily when its kind of output first
//! appears and closes it when another kind takes over.

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

    let mut messages = Vec::new();
    if let Some(instructions) = body.get("instructions").and_then(|i| i.as_str()) {
        if !instructions.is_empty() {
            messages.push(Message::text(Role::System, instructions));
        }
    }

    match body.get("input") {
        Some(Value::String(text)) => messages.push(Message::text(Role::User, text.as_str())),
        Some(Value::Array(items)) => {
            for item in items {
                decode_item(item, &mut messages)?;
            }
        }
        _ => return Err(DecodeError::Missing("input")),
    }

    Ok(ChatRequest {
        model,
        messages,
        tools: decode_tools(body.get("tools")),
        stream: body.get("stream").and_then(|s| s.as_bool()).unwrap_or(false),
        temperature: body.get("temperature").and_then(|t| t.as_f64()),
        max_tokens: body.get("max_output_tokens").and_then(|m| m.as_u64()),
    })
}

fn decode_item(item: &Value, messages: &mut Vec<Message>) -> Result<(), DecodeError> {
    let kind = item.get("type").and_then(|t| t.as_str()).unwrap_or("message");
    match kind {
        "message" => {
            let role_name = item.get("role").and_then(|r| r.as_str()).unwrap_or("user");
            let role = Role::parse(role_name)
                .ok_or_else(|| DecodeError::Invalid(format!("unknown role '{}'", role_name)))?;
            messages.push(Message {
                role,
                content: decode_content(item.get("content")),
                ..Default::default()
            });
        }
        "function_call" => {
            let call = ToolCall {
                id: item
                    .get("call_id")
                    .and_then(|i| i.as_str())
                    .map(str::to_owned)
                    .unwrap_or_else(new_call_id),
                name: item
                    .get("name")
                    .and_then(|n| n.as_str())
                    .ok_or(DecodeError::Missing("function_call.name"))?
                    .to_string(),
                arguments: item
                    .get("arguments")
                    .and_then(|a| a.as_str())
                    .unwrap_or_default()
                    .to_string(),
            };
            // Consecutive calls belong to one assistant turn
            match messages.last_mut() {
                Some(last) if last.role == Role::Assistant && last.content.text().is_empty() => {
                    last.tool_calls.push(call)
                }
                _ => messages.push(Message::assistant_with_calls("", vec![call])),
            }
        }
        "function_call_output" => {
            let output = match item.get("output") {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            messages.push(Message {
                role: Role::Tool,
                content: MessageContent::Text(output),
                tool_call_id: item
                    .get("call_id")
                    .and_then(|i| i.as_str())
                    .map(str::to_owned),
                ..Default::default()
            });
        }
        // Prior reasoning is never sent back upstream
        "reasoning" => {}
        other => tracing::debug!(kind = other, "skipping unsupported input item"),
    }
    Ok(())
}

fn decode_content(raw: Option<&Value>) -> MessageContent {
    match raw {
        Some(Value::String(s)) => MessageContent::Text(s.clone()),
        Some(Value::Array(parts)) => MessageContent::Parts(
            parts
                .iter()
                .filter_map(|part| match part.get("type").and_then(|t| t.as_str()) {
                    Some("input_text") | Some("output_text") | Some("text") => part
                        .get("text")
                        .and_then(|t| t.as_str())
                        .map(|t| ContentPart::Text(t.to_string())),
                    Some("input_image") => part
                        .get("image_url")
                        .and_then(|u| u.as_str())
                        .map(|u| ContentPart::Image(u.to_string())),
                    _ => None,
                })
                .collect(),
        ),
        _ => MessageContent::default(),
    }
}

fn decode_tools(raw: Option<&Value>) -> Vec<ToolSpec> {
    raw.and_then(|t| t.as_array())
        .map(|tools| {
            tools
                .iter()
                .filter(|t| t.get("type").and_then(|k| k.as_str()).unwrap_or("function") == "function")
                .filter_map(|tool| {
                    Some(ToolSpec {
                        name: tool.get("name")?.as_str()?.to_string(),
                        description: tool
                            .get("description")
                            .and_then(|d| d.as_str())
                            .map(str::to_owned),
                        parameters: tool
                            .get("parameters")
                            .cloned()
                            .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenItem {
    Reasoning,
    Message,
}

/// Streaming encoder for `response.*` events
#[derive(Debug)]
pub struct ResponsesEncoder {
    id: String,
    model: String,
    created: i64,
    /// Finished output items, for the final `response.completed`
    output: Vec<Value>,
    open: Option<(OpenItem, String, String)>,
}

impl ResponsesEncoder {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("resp_{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            created: Utc::now().timestamp(),
            output: Vec::new(),
            open: None,
        }
    }

    pub fn start(&mut self) -> Vec<SseEvent> {
        vec![event(
            "response.created",
            json!({"response": self.response("in_progress", Vec::new(), None)}),
        )]
    }

    pub fn reason(&mut self, text: &str) -> Vec<SseEvent> {
        let mut out = self.ensure_open(OpenItem::Reasoning);
        let item_id = self.append(text);
        out.push(event(
            "response.reasoning_summary_text.delta",
            json!({
                "item_id": item_id,
                "output_index": self.output.len(),
                "summary_index": 0,
                "delta": text,
            }),
        ));
        out
    }

    pub fn content(&mut self, text: &str) -> Vec<SseEvent> {
        let mut out = self.ensure_open(OpenItem::Message);
        let item_id = self.append(text);
        out.push(event(
            "response.output_text.delta",
            json!({
                "item_id": item_id,
                "output_index": self.output.len(),
                "content_index": 0,
                "delta": text,
            }),
        ));
        out
    }

    pub fn function_call(&mut self, call: &ToolCall) -> Vec<SseEvent> {
        let mut out = self.close_open();
        let index = self.output.len();
        let item = function_call_item(call);
        out.push(event(
            "response.output_item.added",
            json!({"output_index": index, "item": {
                "type": "function_call",
                "id": item["id"],
                "call_id": call.id,
                "name": call.name,
                "arguments": "",
                "status": "in_progress",
            }}),
        ));
        out.push(event(
            "response.function_call_arguments.delta",
            json!({"item_id": item["id"], "output_index": index, "delta": call.arguments}),
        ));
        out.push(event(
            "response.function_call_arguments.done",
            json!({"item_id": item["id"], "output_index": index, "arguments": call.arguments}),
        ));
        out.push(event(
            "response.output_item.done",
            json!({"output_index": index, "item": item}),
        ));
        self.output.push(item);
        out
    }

    pub fn finish(&mut self, reason: &FinishReason, usage: Option<Usage>) -> Vec<SseEvent> {
        let mut out = self.close_open();
        let (name, status) = match reason {
            FinishReason::Length => ("response.incomplete", "incomplete"),
            _ => ("response.completed", "completed"),
        };
        let mut response = self.response(status, self.output.clone(), usage);
        if *reason == FinishReason::Length {
            response["incomplete_details"] = json!({"reason": "max_output_tokens"});
        }
        out.push(event(name, json!({ "response": response })));
        out
    }

    pub fn error(&mut self, message: &str) -> Vec<SseEvent> {
        let mut out = self.close_open();
        let mut response = self.response("failed", self.output.clone(), None);
        response["error"] = json!({"code": "internal_error", "message": message});
        out.push(event("response.failed", json!({ "response": response })));
        out
    }

    fn ensure_open(&mut self, kind: OpenItem) -> Vec<SseEvent> {
        if matches!(&self.open, Some((open, _, _)) if *open == kind) {
            return Vec::new();
        }
        let mut out = self.close_open();
        let index = self.output.len();
        let id = match kind {
            OpenItem::Reasoning => format!("rs_{}", uuid::Uuid::new_v4().simple()),
            OpenItem::Message => format!("msg_{}", uuid::Uuid::new_v4().simple()),
        };
        match kind {
            OpenItem::Reasoning => {
                out.push(event(
                    "response.output_item.added",
                    json!({"output_index": index, "item": {"type": "reasoning", "id": id, "summary": []}}),
                ));
                out.push(event(
                    "response.reasoning_summary_part.added",
                    json!({"item_id": id, "output_index": index, "summary_index": 0,
                           "part": {"type": "summary_text", "text": ""}}),
                ));
            }
            OpenItem::Message => {
                out.push(event(
                    "response.output_item.added",
                    json!({"output_index": index, "item": {
                        "type": "message", "id": id, "role": "assistant",
                        "status": "in_progress", "content": [],
                    }}),
                ));
                out.push(event(
                    "response.content_part.added",
                    json!({"item_id": id, "output_index": index, "content_index": 0,
                           "part": {"type": "output_text", "text": "", "annotations": []}}),
                ));
            }
        }
        self.open = Some((kind, id, String::new()));
        out
    }

    fn append(&mut self, text: &str) -> String {
        match &mut self.open {
            Some((_, id, buffer)) => {
                buffer.push_str(text);
                id.clone()
            }
            None => String::new(),
        }
    }

    fn close_open(&mut self) -> Vec<SseEvent> {
        let Some((kind, id, text)) = self.open.take() else {
            return Vec::new();
        };
        let index = self.output.len();
        let mut out = Vec::new();
        let item = match kind {
            OpenItem::Reasoning => {
                out.push(event(
                    "response.reasoning_summary_text.done",
                    json!({"item_id": id, "output_index": index, "summary_index": 0, "text": text}),
                ));
                reasoning_item(&id, &text)
            }
            OpenItem::Message => {
                out.push(event(
                    "response.output_text.done",
                    json!({"item_id": id, "output_index": index, "content_index": 0, "text": text}),
                ));
                out.push(event(
                    "response.content_part.done",
                    json!({"item_id": id, "output_index": index, "content_index": 0,
                           "part": {"type": "output_text", "text": text, "annotations": []}}),
                ));
                message_item(&id, &text)
            }
        };
        out.push(event(
            "response.output_item.done",
            json!({"output_index": index, "item": item}),
        ));
        self.output.push(item);
        out
    }

    fn response(&self, status: &str, output: Vec<Value>, usage: Option<Usage>) -> Value {
        let mut response = json!({
            "id": self.id,
            "object": "response",
            "created_at": self.created,
            "status": status,
            "model": self.model,
            "output": output,
        });
        if let Some(usage) = usage {
            response["usage"] = usage_json(usage);
        }
        response
    }
}

fn event(name: &str, mut data: Value) -> SseEvent {
    data["type"] = json!(name);
    SseEvent::named(name, data.to_string())
}

fn usage_json(usage: Usage) -> Value {
    json!({
        "input_tokens": usage.prompt_tokens,
        "output_tokens": usage.completion_tokens,
        "total_tokens": usage.total_tokens,
    })
}

fn reasoning_item(id: &str, text: &str) -> Value {
    json!({
        "type": "reasoning",
        "id": id,
        "summary": [{"type": "summary_text", "text": text}],
    })
}

fn message_item(id: &str, text: &str) -> Value {
    json!({
        "type": "message",
        "id": id,
        "role": "assistant",
        "status": "completed",
        "content": [{"type": "output_text", "text": text, "annotations": []}],
    })
}

fn function_call_item(call: &ToolCall) -> Value {
    json!({
        "type": "function_call",
        "id": format!("fc_{}", uuid::Uuid::new_v4().simple()),
        "call_id": call.id,
        "name": call.name,
        "arguments": call.arguments,
        "status": "completed",
    })
}

/// Non-streaming `response` body
pub fn render_full(model: &str, transcript: &Transcript) -> Value {
    let mut output = Vec::new();
    if !transcript.reasoning.is_empty() {
        output.push(reasoning_item(
            &format!("rs_{}", uuid::Uuid::new_v4().simple()),
            &transcript.reasoning,
        ));
    }
    if !transcript.content.is_empty() {
        output.push(message_item(
            &format!("msg_{}", uuid::Uuid::new_v4().simple()),
            &transcript.content,
        ));
    }
    output.extend(transcript.calls.iter().map(function_call_item));

    let reason = transcript.finish_reason();
    let status = if reason == FinishReason::Length {
        "incomplete"
    } else {
        "completed"
    };
    let mut body = json!({
        "id": format!("resp_{}", uuid::Uuid::new_v4().simple()),
        "object": "response",
        "created_at": Utc::now().timestamp(),
        "status": status,
        "model": model,
        "output": output,
        "usage": usage_json(transcript.usage.unwrap_or_default()),
    });
    if reason == FinishReason::Length {
        body["incomplete_details"] = json!({"reason": "max_output_tokens"});
    }
    body
}

pub fn error_body(kind: &str, message: &str) -> Value {
    json!({"error": {"type": kind, "message": message}})
}
