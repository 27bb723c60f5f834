//! Chat bridges
//!
//! A bridge serves one chat wire dialect. It decodes the client request into
//! the neutral model, derives each upstream call from the running
//! conversation, re-emits the upstream stream in the client's dialect and
//! runs the tool loop:
//!
//! - calls to tools the client declared are forwarded and end the turn
//! - calls to registry tools are executed and folded into the next round
//! - calls to any other name are dropped
//!
//! Everything the client sees goes through [`Output`], which applies the
//! reasoning presentation and either streams events or collects a
//! transcript for a single JSON body.

pub mod claude;
pub mod openai;
pub mod prompt;
pub mod responses;
pub mod think;

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::{json, Value};
use tracing::Instrument;

use crate::config::{ProviderConfig, ProxyConfig};
use crate::error::{HttpError, LlmError};
use crate::http::{event_stream_head, ConnectionWriter, HttpRequest, Response, SseEvent};
use crate::llm::{
    AuditLog, AuditRecord, ChatRequest, FinishReason, Message, StreamEvent, ToolCall, ToolSpec, Usage,
};
use crate::mcp::RegisteredTool;
use crate::server::ServerContext;

pub use claude::ClaudeEncoder;
pub use openai::ChatEncoder;
pub use prompt::PromptOptions;
pub use responses::ResponsesEncoder;
pub use think::{Emission, ThinkState, ThinkTracker};

/// Appended to the content when the tool loop is cut off
const ROUND_LIMIT_NOTICE: &str = "\n\n[tool round limit reached]\n";

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("missing required field '{0}'")]
    Missing(&'static str),

    #[error("{0}")]
    Invalid(String),
}

/// Chat wire dialects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// OpenAI chat completions
    Chat,
    /// Codex responses
    Responses,
    /// Anthropic messages
    Claude,
}

impl Dialect {
    pub fn from_path(path: &str) -> Option<Self> {
        match path.trim_end_matches('/') {
            "/v1/chat/completions" | "/v1/chat/completion" | "/chat/completions" => {
                Some(Dialect::Chat)
            }
            "/v1/responses" | "/responses" => Some(Dialect::Responses),
            "/v1/messages" | "/messages" => Some(Dialect::Claude),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Chat => "chat",
            Dialect::Responses => "responses",
            Dialect::Claude => "claude",
        }
    }

    pub fn decode(&self, body: &Value) -> Result<ChatRequest, DecodeError> {
        match self {
            Dialect::Chat => openai::decode(body),
            Dialect::Responses => responses::decode(body),
            Dialect::Claude => claude::decode(body),
        }
    }

    pub fn encoder(&self, model: &str) -> Encoder {
        match self {
            Dialect::Chat => Encoder::Chat(ChatEncoder::new(model)),
            Dialect::Responses => Encoder::Responses(ResponsesEncoder::new(model)),
            Dialect::Claude => Encoder::Claude(ClaudeEncoder::new(model)),
        }
    }

    pub fn render_full(&self, model: &str, transcript: &Transcript) -> Value {
        match self {
            Dialect::Chat => openai::render_full(model, transcript),
            Dialect::Responses => responses::render_full(model, transcript),
            Dialect::Claude => claude::render_full(model, transcript),
        }
    }

    pub fn error_body(&self, kind: &str, message: &str) -> Value {
        match self {
            Dialect::Chat => openai::error_body(kind, message),
            Dialect::Responses => responses::error_body(kind, message),
            Dialect::Claude => claude::error_body(kind, message),
        }
    }

    pub fn error_response(&self, status: u16, kind: &str, message: &str) -> Response {
        Response::json(status, &self.error_body(kind, message))
    }
}

/// Streaming encoder of one dialect
#[derive(Debug)]
pub enum Encoder {
    Chat(ChatEncoder),
    Responses(ResponsesEncoder),
    Claude(ClaudeEncoder),
}

impl Encoder {
    pub fn start(&mut self) -> Vec<SseEvent> {
        match self {
            Encoder::Chat(e) => e.start(),
            Encoder::Responses(e) => e.start(),
            Encoder::Claude(e) => e.start(),
        }
    }

    pub fn reason(&mut self, text: &str) -> Vec<SseEvent> {
        match self {
            Encoder::Chat(e) => e.reason(text),
            Encoder::Responses(e) => e.reason(text),
            Encoder::Claude(e) => e.reason(text),
        }
    }

    pub fn content(&mut self, text: &str) -> Vec<SseEvent> {
        match self {
            Encoder::Chat(e) => e.content(text),
            Encoder::Responses(e) => e.content(text),
            Encoder::Claude(e) => e.content(text),
        }
    }

    pub fn function_call(&mut self, call: &ToolCall) -> Vec<SseEvent> {
        match self {
            Encoder::Chat(e) => e.function_call(call),
            Encoder::Responses(e) => e.function_call(call),
            Encoder::Claude(e) => e.function_call(call),
        }
    }

    pub fn finish(&mut self, reason: &FinishReason, usage: Option<Usage>) -> Vec<SseEvent> {
        match self {
            Encoder::Chat(e) => e.finish(reason, usage),
            Encoder::Responses(e) => e.finish(reason, usage),
            Encoder::Claude(e) => e.finish(reason, usage),
        }
    }

    pub fn error(&mut self, message: &str) -> Vec<SseEvent> {
        match self {
            Encoder::Chat(e) => e.error(message),
            Encoder::Responses(e) => e.error(message),
            Encoder::Claude(e) => e.error(message),
        }
    }
}

/// Everything sent to the client for one request
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    pub reasoning: String,
    pub content: String,
    pub calls: Vec<ToolCall>,
    pub finish: Option<FinishReason>,
    pub usage: Option<Usage>,
}

impl Transcript {
    pub fn finish_reason(&self) -> FinishReason {
        self.finish.clone().unwrap_or(FinishReason::Stop)
    }

    fn apply(&mut self, emission: &Emission) {
        match emission {
            Emission::Reason(t) => self.reasoning.push_str(t),
            Emission::Content(t) => self.content.push_str(t),
        }
    }
}

fn add_usage(total: Option<Usage>, more: Option<Usage>) -> Option<Usage> {
    match (total, more) {
        (Some(a), Some(b)) => Some(Usage {
            prompt_tokens: a.prompt_tokens + b.prompt_tokens,
            completion_tokens: a.completion_tokens + b.completion_tokens,
            total_tokens: a.total_tokens + b.total_tokens,
        }),
        (a, b) => a.or(b),
    }
}

enum Sink {
    Stream(Encoder),
    Collect,
}

/// Client-facing side of one request
pub struct Output<'w> {
    writer: &'w ConnectionWriter,
    dialect: Dialect,
    model: String,
    sink: Sink,
    think: ThinkTracker,
    transcript: Transcript,
}

impl<'w> Output<'w> {
    /// Streaming output writes the response head right away
    pub async fn open(
        writer: &'w ConnectionWriter,
        dialect: Dialect,
        model: &str,
        stream: bool,
        think: ThinkTracker,
    ) -> Result<Output<'w>, HttpError> {
        let sink = if stream {
            let mut encoder = dialect.encoder(model);
            writer.start_chunked(&event_stream_head()).await?;
            let events = encoder.start();
            for event in &events {
                writer.write_event(event).await?;
            }
            Sink::Stream(encoder)
        } else {
            Sink::Collect
        };
        Ok(Self {
            writer,
            dialect,
            model: model.to_string(),
            sink,
            think,
            transcript: Transcript::default(),
        })
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub async fn reason(&mut self, text: &str) -> Result<(), HttpError> {
        let emissions = self.think.reason(text);
        self.emit(emissions).await
    }

    pub async fn reason_complete(&mut self) -> Result<(), HttpError> {
        let emissions = self.think.reason_complete();
        self.emit(emissions).await
    }

    pub async fn content(&mut self, text: &str) -> Result<(), HttpError> {
        let emissions = self.think.content(text);
        self.emit(emissions).await
    }

    pub async fn function_call(&mut self, call: &ToolCall) -> Result<(), HttpError> {
        let closing = self.think.finish();
        self.emit(closing).await?;
        self.transcript.calls.push(call.clone());
        if let Sink::Stream(encoder) = &mut self.sink {
            let events = encoder.function_call(call);
            send(self.writer, &events).await?;
        }
        Ok(())
    }

    /// Complete the response
    pub async fn finish(mut self, reason: FinishReason, usage: Option<Usage>) -> Result<(), HttpError> {
        let closing = self.think.finish();
        self.emit(closing).await?;
        self.transcript.finish = Some(reason.clone());
        self.transcript.usage = usage;

        match &mut self.sink {
            Sink::Stream(encoder) => {
                let events = encoder.finish(&reason, usage);
                send(self.writer, &events).await?;
                self.writer.finish_chunked().await
            }
            Sink::Collect => {
                let body = self.dialect.render_full(&self.model, &self.transcript);
                self.writer.send_response(&Response::json(200, &body)).await
            }
        }
    }

    /// Report an upstream failure and complete the response
    pub async fn fail(mut self, message: &str) -> Result<(), HttpError> {
        let closing = self.think.finish();
        self.emit(closing).await?;
        match &mut self.sink {
            Sink::Stream(encoder) => {
                let events = encoder.error(message);
                send(self.writer, &events).await?;
                self.writer.finish_chunked().await
            }
            Sink::Collect => {
                let response = self.dialect.error_response(502, "internal_error", message);
                self.writer.send_response(&response).await
            }
        }
    }

    async fn emit(&mut self, emissions: Vec<Emission>) -> Result<(), HttpError> {
        for emission in emissions {
            self.transcript.apply(&emission);
            if let Sink::Stream(encoder) = &mut self.sink {
                let events = match &emission {
                    Emission::Reason(t) => encoder.reason(t),
                    Emission::Content(t) => encoder.content(t),
                };
                send(self.writer, &events).await?;
            }
        }
        Ok(())
    }
}

async fn send(writer: &ConnectionWriter, events: &[SseEvent]) -> Result<(), HttpError> {
    for event in events {
        writer.write_event(event).await?;
    }
    Ok(())
}

/// Serves one dialect on one tunnel
pub struct Bridge {
    dialect: Dialect,
    ctx: Arc<ServerContext>,
    served: u64,
}

impl Bridge {
    pub fn new(dialect: Dialect, ctx: Arc<ServerContext>) -> Self {
        Self {
            dialect,
            ctx,
            served: 0,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Requests this bridge has answered
    pub fn served(&self) -> u64 {
        self.served
    }

    /// Answer one chat request. Only a failed socket write is an error;
    /// everything else becomes a well-formed response.
    pub async fn handle(&mut self, request: &HttpRequest, writer: &ConnectionWriter) -> Result<(), HttpError> {
        self.served += 1;

        let body: Value = match serde_json::from_slice(&request.body) {
            Ok(v) => v,
            Err(e) => {
                let response = self.dialect.error_response(
                    400,
                    "invalid_request_error",
                    &format!("invalid JSON body: {}", e),
                );
                return writer.send_response(&response).await;
            }
        };
        let chat = match self.dialect.decode(&body) {
            Ok(chat) => chat,
            Err(e) => {
                let response = self.dialect.error_response(400, "invalid_request_error", &e.to_string());
                return writer.send_response(&response).await;
            }
        };

        let config = self.ctx.config.current();
        let Some(provider) = config.route(&chat.model).cloned() else {
            let message = LlmError::NoProvider(chat.model.clone()).to_string();
            let response = self.dialect.error_response(400, "invalid_request_error", &message);
            return writer.send_response(&response).await;
        };

        let span = tracing::info_span!(
            "chat",
            dialect = self.dialect.name(),
            model = %chat.model,
            provider = %provider.name,
            stream = chat.stream,
        );
        self.run(chat, &config, &provider, writer).instrument(span).await
    }

    async fn run(
        &self,
        chat: ChatRequest,
        config: &ProxyConfig,
        provider: &ProviderConfig,
        writer: &ConnectionWriter,
    ) -> Result<(), HttpError> {
        let cancel = writer.cancel_token().clone();
        let client_tools: HashSet<String> = chat.tools.iter().map(|t| t.name.clone()).collect();
        let tools = self.offered_tools(&chat.tools, &client_tools);
        let options = PromptOptions {
            native_tools: provider.native_tools,
            output_language: config.bridge.output_language.clone(),
            max_code_block_chars: config.bridge.max_code_block_chars,
        };
        let audit = AuditLog::new(config.audit.dir.clone());

        tracing::info!(
            messages = chat.messages.len(),
            client_tools = client_tools.len(),
            tools = tools.len(),
            "chat request"
        );

        let mut out = Output::open(
            writer,
            self.dialect,
            &chat.model,
            chat.stream,
            ThinkTracker::new(config.bridge.think_mode),
        )
        .await?;

        let mut conversation = chat.clone();
        let mut usage: Option<Usage> = None;
        let mut round = 0usize;

        loop {
            round += 1;
            let derived = prompt::derive(&conversation, &tools, &options);
            let body = prompt::upstream_body(&derived, &tools, &options);

            let mut stream = match self.ctx.llm.open(provider, &body, cancel.child_token()).await {
                Ok(stream) => stream,
                Err(LlmError::Cancelled) => return Ok(()),
                Err(e) => {
                    tracing::warn!(round, "upstream call failed: {}", e);
                    return out.fail(&e.to_string()).await;
                }
            };

            let mut calls: Vec<ToolCall> = Vec::new();
            let mut finish = FinishReason::Stop;
            while let Some(event) = stream.next().await {
                match event {
                    Ok(StreamEvent::Reason(text)) => out.reason(&text).await?,
                    Ok(StreamEvent::ReasonComplete) => out.reason_complete().await?,
                    Ok(StreamEvent::Content(text)) => out.content(&text).await?,
                    Ok(StreamEvent::ToolCall(call)) => calls.push(call),
                    Ok(StreamEvent::Finish { reason, usage: reported }) => {
                        finish = reason;
                        usage = add_usage(usage, reported);
                    }
                    Err(LlmError::Cancelled) => {
                        stream.stop();
                        return Ok(());
                    }
                    Err(e) => {
                        stream.stop();
                        tracing::warn!(round, "upstream stream failed: {}", e);
                        return out.fail(&e.to_string()).await;
                    }
                }
            }

            let message = stream.message();
            audit
                .record(&AuditRecord::new(
                    &provider.name,
                    &chat.model,
                    stream.usage(),
                    body,
                    audit_response(&message),
                ))
                .await;

            if finish != FinishReason::ToolCalls || calls.is_empty() {
                let reason = match finish {
                    FinishReason::ToolCalls => FinishReason::Stop,
                    other => other,
                };
                return out.finish(reason, usage).await;
            }

            let mut forward: Vec<ToolCall> = Vec::new();
            let mut execute: Vec<(ToolCall, RegisteredTool)> = Vec::new();
            for call in calls {
                if client_tools.contains(&call.name) {
                    forward.push(call);
                } else if let Some(tool) = self.ctx.registry.get(&call.name) {
                    execute.push((call, tool));
                } else {
                    tracing::debug!(tool = %call.name, "dropping call to unknown tool");
                }
            }

            if !forward.is_empty() {
                if !execute.is_empty() {
                    tracing::warn!(
                        skipped = execute.len(),
                        "turn ends with client tool calls, registry calls not run"
                    );
                }
                for call in &forward {
                    out.function_call(call).await?;
                }
                return out.finish(FinishReason::ToolCalls, usage).await;
            }
            if execute.is_empty() {
                return out.finish(FinishReason::Stop, usage).await;
            }
            if round >= config.bridge.max_tool_rounds {
                tracing::warn!(round, "tool round limit reached");
                out.content(ROUND_LIMIT_NOTICE).await?;
                return out.finish(FinishReason::Stop, usage).await;
            }

            let names: Vec<&str> = execute.iter().map(|(c, _)| c.name.as_str()).collect();
            tracing::info!(round, tools = ?names, "running tool calls");

            let invoker = self.ctx.invoker.as_ref();
            let token = &cancel;
            let results = join_all(execute.iter().map(|(call, tool)| async move {
                invoker
                    .invoke(&tool.server, &tool.tool, call.arguments_json(), token)
                    .await
            }))
            .await;
            if cancel.is_cancelled() {
                return Ok(());
            }

            let mut folded: Vec<(ToolCall, String)> = Vec::with_capacity(execute.len());
            for ((call, _), result) in execute.iter().zip(results) {
                let (ok, text) = match result {
                    Ok(text) => (true, text),
                    Err(e) => {
                        tracing::warn!(tool = %call.name, "tool call failed: {}", e);
                        (false, format!("error: {}", e))
                    }
                };
                out.content(&prompt::tool_result_block(&call.name, ok, &text))
                    .await?;
                folded.push((call.clone(), text));
            }

            let executed: Vec<ToolCall> = execute.into_iter().map(|(c, _)| c).collect();
            conversation.messages.extend(prompt::fold_round(
                &message.content.text(),
                &executed,
                &folded,
            ));
        }
    }

    /// Client-declared tools, plus registry tools whose names they don't shadow
    fn offered_tools(&self, declared: &[ToolSpec], client_tools: &HashSet<String>) -> Vec<ToolSpec> {
        let mut tools = declared.to_vec();
        tools.extend(
            self.ctx
                .registry
                .list()
                .into_iter()
                .filter(|t| !client_tools.contains(&t.name))
                .map(|t| t.to_spec()),
        );
        tools
    }
}

fn audit_response(message: &Message) -> Value {
    let mut response = message.to_openai();
    if let Some(reasoning) = &message.reasoning {
        response["reasoning_content"] = json!(reasoning);
    }
    response
}
