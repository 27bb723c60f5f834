//! Provider-neutral chat model
//!
//! Every inbound dialect decodes into these types, and every upstream call
//! is built from them. Requests are never edited in place; the bridge
//! derives a new [`ChatRequest`] per upstream call.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    Developer,
    #[default]
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::Developer => "developer",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Role::System),
            "developer" => Some(Role::Developer),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" | "function" => Some(Role::Tool),
            _ => None,
        }
    }
}

/// One part of a multi-part message
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    /// Image by URL (http(s) or `data:` URL)
    Image(String),
}

/// Flat text or ordered parts
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// Concatenated text of all text parts
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text(t) => Some(t.as_str()),
                    ContentPart::Image(_) => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// New content with every text part rewritten by `f`
    pub fn map_text(&self, mut f: impl FnMut(&str) -> String) -> Self {
        match self {
            MessageContent::Text(t) => MessageContent::Text(f(t)),
            MessageContent::Parts(parts) => MessageContent::Parts(
                parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text(t) => ContentPart::Text(f(t)),
                        other => other.clone(),
                    })
                    .collect(),
            ),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(t) => t.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }

    fn to_openai(&self) -> Value {
        match self {
            MessageContent::Text(t) => Value::String(t.clone()),
            MessageContent::Parts(parts) => Value::Array(
                parts
                    .iter()
                    .map(|p| match p {
                        ContentPart::Text(t) => json!({"type": "text", "text": t}),
                        ContentPart::Image(url) => {
                            json!({"type": "image_url", "image_url": {"url": url}})
                        }
                    })
                    .collect(),
            ),
        }
    }
}

/// A completed tool call. `arguments` is the raw JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

impl ToolCall {
    /// Arguments as JSON; unparseable or empty arguments become `{}`
    pub fn arguments_json(&self) -> Value {
        serde_json::from_str(&self.arguments)
            .ok()
            .filter(|v: &Value| v.is_object())
            .unwrap_or_else(|| Value::Object(Map::new()))
    }
}

pub fn new_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    /// Reasoning text carried on assistant turns
    pub reasoning: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    /// Set on tool-result messages
    pub tool_call_id: Option<String>,
    pub name: Option<String>,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
            ..Default::default()
        }
    }

    pub fn assistant_with_calls(text: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            tool_calls: calls,
            ..Default::default()
        }
    }

    pub fn tool_result(call: &ToolCall, output: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Text(output.into()),
            tool_call_id: Some(call.id.clone()),
            name: Some(call.name.clone()),
            ..Default::default()
        }
    }

    /// OpenAI chat-completions message object
    pub fn to_openai(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("role".into(), json!(self.role.as_str()));
        obj.insert("content".into(), self.content.to_openai());
        if !self.tool_calls.is_empty() {
            obj.insert(
                "tool_calls".into(),
                Value::Array(
                    self.tool_calls
                        .iter()
                        .map(|c| {
                            json!({
                                "id": c.id,
                                "type": "function",
                                "function": {"name": c.name, "arguments": c.arguments},
                            })
                        })
                        .collect(),
                ),
            );
        }
        if let Some(id) = &self.tool_call_id {
            obj.insert("tool_call_id".into(), json!(id));
        }
        if let Some(name) = &self.name {
            if self.role == Role::Tool {
                obj.insert("name".into(), json!(name));
            }
        }
        Value::Object(obj)
    }
}

/// A tool the model may call
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    /// JSON schema of the arguments object
    pub parameters: Value,
}

impl ToolSpec {
    pub fn to_openai(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description.clone().unwrap_or_default(),
                "parameters": self.parameters,
            }
        })
    }
}

/// A chat request in neutral form
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    /// Tools declared by the client
    pub tools: Vec<ToolSpec>,
    pub stream: bool,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl ChatRequest {
    /// Streaming OpenAI chat-completions body for the upstream provider.
    ///
    /// `tools` is omitted when empty; the caller decides whether the
    /// provider gets native tools or a textual catalogue.
    pub fn to_upstream_body(&self, tools: &[ToolSpec]) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": self.messages.iter().map(Message::to_openai).collect::<Vec<_>>(),
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.iter().map(ToolSpec::to_openai).collect());
        }
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(m) = self.max_tokens {
            body["max_tokens"] = json!(m);
        }
        body
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    pub fn parse(s: &str) -> Self {
        match s {
            "stop" | "end_turn" => FinishReason::Stop,
            "length" | "max_tokens" => FinishReason::Length,
            "tool_calls" | "function_call" | "tool_use" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }

    /// OpenAI chat spelling
    pub fn as_openai(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Other(s) => s,
        }
    }
}

/// Token usage as reported by the upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}
