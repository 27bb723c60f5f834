//! Upstream stream reassembly
//!
//! Turns decoded OpenAI-style chunk payloads into an ordered sequence of
//! [`StreamEvent`]s. Output depends only on the concatenated payloads, never
//! on how the bytes were split into network reads.
//!
//! Reasoning comes from a dedicated field (`reasoning_content` or
//! `reasoning`) when the provider sends one. Otherwise, the first `<think>`
//! tag in the content starts reasoning that runs to the matching close tag;
//! text before it is ordinary content. Once a reasoning field or a closed
//! think block has been seen, later tags are left alone.

use serde::Deserialize;
use serde_json::Value;

use super::types::{new_call_id, FinishReason, Message, MessageContent, Role, ToolCall, Usage};
use crate::extract::{ToolCallExtractor, ToolCallParserRegistry, TOOL_CALL_CLOSE, TOOL_CALL_OPEN};

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

/// One reassembled piece of the upstream response
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Reason(String),
    /// No further reasoning follows
    ReasonComplete,
    Content(String),
    ToolCall(ToolCall),
    Finish {
        reason: FinishReason,
        usage: Option<Usage>,
    },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    choices: Option<Vec<Choice>>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Option<Part>,
    /// Present on non-incremental responses
    #[serde(default)]
    message: Option<Part>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Part {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<CallFragment>>,
}

impl Part {
    fn reasoning_text(&self) -> Option<&str> {
        self.reasoning_content
            .as_deref()
            .or(self.reasoning.as_deref())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct CallFragment {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionFragment>,
}

#[derive(Debug, Deserialize)]
struct FunctionFragment {
    #[serde(default)]
    name: Option<String>,
    /// Usually a string; some providers send an object on full messages
    #[serde(default)]
    arguments: Option<Value>,
}

/// How content is being interpreted with respect to `<think>` tags
#[derive(Debug, Clone, PartialEq)]
enum TagMode {
    /// No think block yet; holds a possible partial `<think>`
    Undecided(String),
    /// Inside `<think>`; holds a possible partial close tag
    InTag(String),
    Plain,
}

/// Per-call reassembly state
pub struct StreamAssembler {
    tag_mode: TagMode,
    reasoning_field: bool,
    reason_open: bool,
    reason_done: bool,
    extractor: ToolCallExtractor,
    parsers: ToolCallParserRegistry,
    pending_call: Option<ToolCall>,
    finish_reason: Option<FinishReason>,
    usage: Option<Usage>,
    finished: bool,

    reason_text: String,
    content_text: String,
    tool_calls: Vec<ToolCall>,
}

impl Default for StreamAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self {
            tag_mode: TagMode::Undecided(String::new()),
            reasoning_field: false,
            reason_open: false,
            reason_done: false,
            extractor: ToolCallExtractor::default(),
            parsers: ToolCallParserRegistry::new(),
            pending_call: None,
            finish_reason: None,
            usage: None,
            finished: false,
            reason_text: String::new(),
            content_text: String::new(),
            tool_calls: Vec::new(),
        }
    }

    /// Whether the terminal `Finish` event has been produced
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed one SSE data payload. Payloads that are not a chunk envelope
    /// are ignored.
    pub fn push_payload(&mut self, payload: &str) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        let envelope: Envelope = match serde_json::from_str(payload) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!("skipping undecodable upstream payload: {}", e);
                return out;
            }
        };
        if envelope.usage.is_some() {
            self.usage = envelope.usage;
        }

        let mut full = false;
        // Only the first choice is surfaced; n > 1 is never requested
        if let Some(choice) = envelope.choices.into_iter().flatten().next() {
            if let Some(message) = choice.message {
                full = true;
                self.push_part(message, &mut out);
                self.finalize_pending_call(&mut out);
            } else if let Some(delta) = choice.delta {
                self.push_part(delta, &mut out);
            }
            if let Some(reason) = choice.finish_reason.as_deref().filter(|r| !r.is_empty()) {
                self.finish_reason = Some(FinishReason::parse(reason));
                self.finalize_pending_call(&mut out);
            }
        }

        if full {
            out.extend(self.finish());
        }
        out
    }

    /// End of stream. Flushes every held-back buffer and emits `Finish`
    /// once; later calls return nothing.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.finalize_pending_call(&mut out);

        match std::mem::replace(&mut self.tag_mode, TagMode::Plain) {
            TagMode::Undecided(held) => self.push_content(&held, &mut out),
            TagMode::InTag(held) => self.emit_reason(held, &mut out),
            TagMode::Plain => {}
        }
        let tail = self.extractor.flush();
        self.emit_content(tail, &mut out);
        self.complete_reason(&mut out);

        let mut reason = self.finish_reason.take().unwrap_or(FinishReason::Stop);
        if !self.tool_calls.is_empty() && reason == FinishReason::Stop {
            // Calls extracted from content arrive with a plain `stop`
            reason = FinishReason::ToolCalls;
        }
        out.push(StreamEvent::Finish {
            reason,
            usage: self.usage,
        });
        self.finished = true;
        out
    }

    /// The assistant message assembled so far
    pub fn message(&self) -> Message {
        Message {
            role: Role::Assistant,
            content: MessageContent::Text(self.content_text.clone()),
            reasoning: (!self.reason_text.is_empty()).then(|| self.reason_text.clone()),
            tool_calls: self.tool_calls.clone(),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn usage(&self) -> Option<Usage> {
        self.usage
    }

    fn push_part(&mut self, part: Part, out: &mut Vec<StreamEvent>) {
        if let Some(reasoning) = part.reasoning_text() {
            self.reasoning_field = true;
            if let TagMode::Undecided(held) = &self.tag_mode {
                if held.is_empty() {
                    self.tag_mode = TagMode::Plain;
                }
            }
            self.emit_reason(reasoning.to_string(), out);
        }

        for fragment in part.tool_calls.into_iter().flatten() {
            self.push_call_fragment(fragment, out);
        }

        if let Some(content) = part.content.as_deref().filter(|c| !c.is_empty()) {
            self.push_content(content, out);
        }
    }

    fn push_content(&mut self, content: &str, out: &mut Vec<StreamEvent>) {
        match &mut self.tag_mode {
            TagMode::Plain => {
                self.complete_reason(out);
                self.extract(content, out);
            }
            TagMode::Undecided(held) => {
                held.push_str(content);
                // Whitespace ahead of a leading tag is not content
                let leading = self.content_text.is_empty();
                if self.reasoning_field {
                    let held = std::mem::take(held);
                    self.tag_mode = TagMode::Plain;
                    self.push_content(&held, out);
                } else if let Some(idx) = held.find(THINK_OPEN) {
                    let before = held[..idx].to_string();
                    let rest = held[idx + THINK_OPEN.len()..].to_string();
                    self.tag_mode = TagMode::InTag(String::new());
                    if !(leading && before.trim().is_empty()) {
                        self.extract(&before, out);
                    }
                    self.push_content(&rest, out);
                } else {
                    let hold = partial_suffix(held, THINK_OPEN);
                    let ready = held[..held.len() - hold].to_string();
                    if !ready.is_empty() && !(leading && ready.trim().is_empty()) {
                        *held = held[held.len() - hold..].to_string();
                        self.extract(&ready, out);
                    }
                }
            }
            TagMode::InTag(held) => {
                held.push_str(content);
                if let Some(idx) = held.find(THINK_CLOSE) {
                    let reason = held[..idx].to_string();
                    let rest = held[idx + THINK_CLOSE.len()..].to_string();
                    self.tag_mode = TagMode::Plain;
                    self.emit_reason(reason, out);
                    self.complete_reason(out);
                    self.push_content(&rest, out);
                } else {
                    let hold = partial_suffix(held, THINK_CLOSE);
                    let ready = held[..held.len() - hold].to_string();
                    let keep = held[held.len() - hold..].to_string();
                    *held = keep;
                    self.emit_reason(ready, out);
                }
            }
        }
    }

    fn extract(&mut self, content: &str, out: &mut Vec<StreamEvent>) {
        for segment in self.extractor.push(content) {
            self.emit_content(segment.text, out);
            if let Some(body) = segment.call {
                match self.parsers.parse(&body) {
                    Some((parsed, parser)) => {
                        tracing::debug!(parser, tool = %parsed.name, "tool call extracted from content");
                        let call = ToolCall {
                            id: new_call_id(),
                            name: parsed.name,
                            arguments: parsed.arguments.to_string(),
                        };
                        self.tool_calls.push(call.clone());
                        out.push(StreamEvent::ToolCall(call));
                    }
                    None => {
                        // Unparseable bodies stay visible as text
                        self.emit_content(format!("{}{}{}", TOOL_CALL_OPEN, body, TOOL_CALL_CLOSE), out);
                    }
                }
            }
        }
    }

    fn push_call_fragment(&mut self, fragment: CallFragment, out: &mut Vec<StreamEvent>) {
        let (name, arguments) = match fragment.function {
            Some(f) => (f.name.unwrap_or_default(), f.arguments),
            None => (String::new(), None),
        };
        let arguments = match arguments {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };

        if !name.is_empty() {
            self.finalize_pending_call(out);
            self.pending_call = Some(ToolCall {
                id: fragment.id.filter(|id| !id.is_empty()).unwrap_or_else(new_call_id),
                name,
                arguments,
            });
            return;
        }

        match &mut self.pending_call {
            Some(call) => {
                call.arguments.push_str(&arguments);
                if let Some(id) = fragment.id.filter(|id| !id.is_empty()) {
                    call.id = id;
                }
            }
            None => tracing::debug!("tool-call continuation without a started call"),
        }
    }

    fn finalize_pending_call(&mut self, out: &mut Vec<StreamEvent>) {
        if let Some(call) = self.pending_call.take() {
            self.tool_calls.push(call.clone());
            out.push(StreamEvent::ToolCall(call));
        }
    }

    fn emit_reason(&mut self, text: String, out: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        self.reason_open = true;
        self.reason_text.push_str(&text);
        out.push(StreamEvent::Reason(text));
    }

    fn complete_reason(&mut self, out: &mut Vec<StreamEvent>) {
        if self.reason_open && !self.reason_done {
            self.reason_done = true;
            out.push(StreamEvent::ReasonComplete);
        }
    }

    fn emit_content(&mut self, text: String, out: &mut Vec<StreamEvent>) {
        if text.is_empty() {
            return;
        }
        self.content_text.push_str(&text);
        out.push(StreamEvent::Content(text));
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `delim`
fn partial_suffix(text: &str, delim: &str) -> usize {
    let max = delim.len().saturating_sub(1).min(text.len());
    (1..=max)
        .rev()
        .find(|&k| {
            let start = text.len() - k;
            text.is_char_boundary(start) && delim.starts_with(&text[start..])
        })
        .unwrap_or(0)
}
