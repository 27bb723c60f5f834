//! Upstream streaming client
//!
//! POSTs a chat-completions body to an OpenAI-compatible provider and exposes
//! the reply as a pull-based sequence of [`StreamEvent`]s. Providers that
//! answer with a plain JSON body instead of an event stream are handled as a
//! single full message.

use std::collections::VecDeque;

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::assembler::{StreamAssembler, StreamEvent};
use super::types::{Message, Usage};
use crate::config::ProviderConfig;
use crate::error::LlmError;
use crate::http::SseDecoder;

const MAX_ERROR_BODY: usize = 2048;

/// Shared HTTP client for upstream calls. Cheap to clone.
#[derive(Clone, Default)]
pub struct LlmClient {
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Open a streaming call. Returning `Ok` means the upstream accepted the
    /// request and the body is being received.
    pub async fn open(
        &self,
        provider: &ProviderConfig,
        body: &Value,
        cancel: CancellationToken,
    ) -> Result<UpstreamStream, LlmError> {
        let url = format!("{}/chat/completions", provider.base_url.trim_end_matches('/'));

        let mut request = self
            .http
            .post(&url)
            .header("Accept", "text/event-stream")
            .json(body);
        if let Some(key) = provider.resolved_api_key().filter(|k| !k.is_empty()) {
            request = request.bearer_auth(key);
        }
        for (name, value) in provider.resolved_headers() {
            request = request.header(name, value);
        }

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            sent = request.send() => sent?,
        };

        let status = response.status();
        if !status.is_success() {
            let mut text = response.text().await.unwrap_or_default();
            if text.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("text/event-stream"))
            .unwrap_or(true);

        tracing::info!(
            provider = %provider.name,
            model = body.get("model").and_then(|m| m.as_str()).unwrap_or(""),
            event_stream,
            "upstream connected"
        );

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();

        Ok(UpstreamStream {
            body: Some(body),
            event_stream,
            decoder: SseDecoder::new(),
            raw: Vec::new(),
            assembler: StreamAssembler::new(),
            pending: VecDeque::new(),
            cancel,
        })
    }
}

/// One in-flight upstream response
pub struct UpstreamStream {
    body: Option<BoxStream<'static, Result<Vec<u8>, reqwest::Error>>>,
    event_stream: bool,
    decoder: SseDecoder,
    /// Whole body of a non-SSE reply
    raw: Vec<u8>,
    assembler: StreamAssembler,
    pending: VecDeque<StreamEvent>,
    cancel: CancellationToken,
}

impl UpstreamStream {
    /// Next event, or `None` once the response is complete or stopped.
    pub async fn next(&mut self) -> Option<Result<StreamEvent, LlmError>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.assembler.is_finished() {
                self.stop();
                return None;
            }
            let body = self.body.as_mut()?;

            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => None,
                chunk = body.next() => Some(chunk),
            };

            match chunk {
                None => {
                    self.stop();
                    return Some(Err(LlmError::Cancelled));
                }
                Some(Some(Ok(bytes))) => {
                    if let Err(e) = self.ingest(&bytes) {
                        self.stop();
                        return Some(Err(e));
                    }
                }
                Some(Some(Err(e))) => {
                    self.stop();
                    return Some(Err(LlmError::Transport(e)));
                }
                Some(None) => {
                    if let Err(e) = self.end_of_body() {
                        self.stop();
                        return Some(Err(e));
                    }
                    self.body = None;
                }
            }
        }
    }

    /// Close the upstream connection. Safe to call any number of times.
    pub fn stop(&mut self) {
        if self.body.take().is_some() {
            tracing::debug!("upstream stream closed");
        }
    }

    /// Assistant message assembled so far
    pub fn message(&self) -> Message {
        self.assembler.message()
    }

    pub fn usage(&self) -> Option<Usage> {
        self.assembler.usage()
    }

    fn ingest(&mut self, bytes: &[u8]) -> Result<(), LlmError> {
        if !self.event_stream {
            self.raw.extend_from_slice(bytes);
            return Ok(());
        }
        for event in self.decoder.push(bytes) {
            self.handle_payload(&event.data, event.is_done())?;
        }
        Ok(())
    }

    fn end_of_body(&mut self) -> Result<(), LlmError> {
        if self.event_stream {
            if let Some(event) = self.decoder.finish() {
                self.handle_payload(&event.data, event.is_done())?;
            }
        } else {
            let raw = std::mem::take(&mut self.raw);
            let text = String::from_utf8_lossy(&raw);
            self.handle_payload(&text, false)?;
        }
        self.pending.extend(self.assembler.finish());
        Ok(())
    }

    fn handle_payload(&mut self, payload: &str, done: bool) -> Result<(), LlmError> {
        if done {
            self.pending.extend(self.assembler.finish());
            return Ok(());
        }
        if let Some(message) = error_payload(payload) {
            return Err(LlmError::Upstream(message));
        }
        self.pending.extend(self.assembler.push_payload(payload));
        Ok(())
    }
}

/// Error message of an in-stream `{"error": ...}` payload
fn error_payload(payload: &str) -> Option<String> {
    if !payload.contains("\"error\"") {
        return None;
    }
    let value: Value = serde_json::from_str(payload).ok()?;
    let error = value.get("error")?;
    if error.is_null() {
        return None;
    }
    Some(
        error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| error.to_string()),
    )
}
