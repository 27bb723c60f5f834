//! Per-connection protocol router
//!
//! A tunnel takes the requests parsed off one connection, one at a time, and
//! routes them: model listing, one of the chat bridges, or the MCP endpoint.
//! Bridges are created on first use and kept for the life of the tunnel.
//! The tunnel is also the notification delegate for MCP sessions that
//! registered through it.

pub mod models;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::bridge::{Bridge, Dialect};
use crate::error::{HttpError, McpError};
use crate::http::{event_stream_head, ConnectionWriter, HttpRequest, Inbound, Response, SseEvent};
use crate::mcp::{McpReply, McpRequest, Notice, TunnelId};
use crate::server::ServerContext;

pub use models::ModelCatalog;

pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Pending notices per tunnel; one list_changed is enough to trigger a refetch
const NOTICE_QUEUE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Unknown,
    Models,
    Completions,
    Mcp,
    McpSse,
    Error,
}

pub struct Tunnel {
    id: TunnelId,
    ctx: Arc<ServerContext>,
    writer: ConnectionWriter,
    state: TunnelState,
    bridges: HashMap<Dialect, Bridge>,
    notice_tx: mpsc::Sender<Notice>,
    notice_rx: mpsc::Receiver<Notice>,
}

impl Tunnel {
    pub fn new(id: TunnelId, ctx: Arc<ServerContext>, writer: ConnectionWriter) -> Self {
        let (notice_tx, notice_rx) = mpsc::channel(NOTICE_QUEUE);
        Self {
            id,
            ctx,
            writer,
            state: TunnelState::Unknown,
            bridges: HashMap::new(),
            notice_tx,
            notice_rx,
        }
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    /// Serve requests until the connection closes. Always releases the
    /// tunnel's MCP sessions on the way out.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Inbound>) {
        let cancel = self.writer.cancel_token().clone();

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = inbound.recv() => item,
            };
            match item {
                None => break,
                Some(Inbound::Malformed(e)) => {
                    self.state = TunnelState::Error;
                    tracing::debug!("malformed request: {}", e);
                    let status = match e {
                        HttpError::BodyTooLarge(_) => 413,
                        _ => 400,
                    };
                    let response = Response::error(status, "invalid_request_error", &e.to_string())
                        .with_header("Connection", "close");
                    let _ = self.writer.send_response(&response).await;
                    break;
                }
                Some(Inbound::Request(request)) => {
                    let keep_alive = request.keep_alive();
                    if let Err(e) = self.dispatch(&request).await {
                        self.state = TunnelState::Error;
                        tracing::debug!("connection write failed: {}", e);
                        break;
                    }
                    if !keep_alive {
                        break;
                    }
                }
            }
        }

        cancel.cancel();
        self.ctx.sessions.release(self.id).await;
        tracing::debug!(tunnel = self.id, state = ?self.state, "tunnel closed");
    }

    async fn dispatch(&mut self, request: &HttpRequest) -> Result<(), HttpError> {
        tracing::info!(method = %request.method, path = %request.path, "request");

        if request.method == "OPTIONS" {
            return self.writer.send_response(&preflight()).await;
        }

        let path = request.path.trim_end_matches('/');
        if path == "/v1/models" || path == "/models" {
            if request.method != "GET" {
                return self.method_not_allowed("GET").await;
            }
            self.state = TunnelState::Models;
            let listing = self.ctx.models.listing(&self.ctx.config.current());
            return self.writer.send_response(&Response::json(200, &listing)).await;
        }

        if let Some(dialect) = Dialect::from_path(path) {
            if request.method != "POST" {
                return self.method_not_allowed("POST").await;
            }
            self.state = TunnelState::Completions;
            let ctx = &self.ctx;
            let bridge = self
                .bridges
                .entry(dialect)
                .or_insert_with(|| Bridge::new(dialect, ctx.clone()));
            return bridge.handle(request, &self.writer).await;
        }

        if path == "/mcp" {
            return match request.method.as_str() {
                "POST" => self.mcp_post(request).await,
                "GET" => self.mcp_stream(request).await,
                "DELETE" => self.mcp_delete(request).await,
                _ => self.method_not_allowed("GET, POST, DELETE").await,
            };
        }

        let response = Response::error(404, "not_found", &format!("no route for {}", request.path));
        self.writer.send_response(&response).await
    }

    async fn method_not_allowed(&self, allow: &str) -> Result<(), HttpError> {
        let response = Response::error(405, "method_not_allowed", "method not allowed")
            .with_header("Allow", allow);
        self.writer.send_response(&response).await
    }

    async fn mcp_post(&mut self, request: &HttpRequest) -> Result<(), HttpError> {
        self.state = TunnelState::Mcp;

        let message = match McpRequest::parse(&request.body) {
            Ok(message) => message,
            Err(e) => {
                let response = Response::json(400, &e.envelope(None));
                return self.writer.send_response(&response).await;
            }
        };

        let header_id = request.header(SESSION_HEADER).filter(|id| !id.is_empty());
        let session = if message.method == "initialize" || header_id.is_some() {
            self.ctx.sessions.open(header_id, self.id).await
        } else {
            None
        };

        if message.method == "notifications/initialized" {
            if let Some(id) = &session {
                self.ctx.sessions.mark_initialized(id).await;
                self.ctx
                    .sessions
                    .register(id, self.id, self.notice_tx.clone())
                    .await;
            }
        }

        let reply = self
            .ctx
            .mcp
            .handle(&message, self.writer.cancel_token())
            .await;
        let response = match reply {
            McpReply::Body(body) => Response::json(200, &body),
            McpReply::Accepted => Response::empty(202),
        };
        let response = match session {
            Some(id) => response.with_header(SESSION_HEADER, id),
            None => response,
        };
        self.writer.send_response(&response).await
    }

    /// Notification stream. Delivers the first notice, then closes the
    /// stream so the client reconnects and fetches the new tool list.
    async fn mcp_stream(&mut self, request: &HttpRequest) -> Result<(), HttpError> {
        let Some(header_id) = request.header(SESSION_HEADER).filter(|id| !id.is_empty()) else {
            let error = McpError::invalid_request();
            let response = Response::json(400, &error.envelope(None));
            return self.writer.send_response(&response).await;
        };
        let Some(id) = self.ctx.sessions.open(Some(header_id), self.id).await else {
            let response = Response::error(503, "unavailable", "session table unavailable");
            return self.writer.send_response(&response).await;
        };

        // Notices queued while this tunnel only served POSTs are stale
        while self.notice_rx.try_recv().is_ok() {}
        self.ctx
            .sessions
            .register_stream(&id, self.id, self.notice_tx.clone())
            .await;
        self.state = TunnelState::McpSse;

        let head = event_stream_head().header(SESSION_HEADER, id.clone());
        self.writer.start_chunked(&head).await?;
        tracing::debug!(session = %id, "notification stream opened");

        let cancel = self.writer.cancel_token().clone();
        let notice = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            notice = self.notice_rx.recv() => notice,
        };
        let Some(notice) = notice else {
            return self.writer.finish_chunked().await;
        };

        let event = SseEvent::named("message", notice.to_jsonrpc().to_string());
        self.writer.write_event(&event).await?;
        self.writer.finish_chunked().await?;

        let grace = self.ctx.config.current().bridge.sse_close_grace();
        tokio::time::sleep(grace).await;
        self.ctx.sessions.remove(&id).await;
        tracing::info!(session = %id, "closed notification stream after {:?}", notice);
        cancel.cancel();
        Ok(())
    }

    async fn mcp_delete(&mut self, request: &HttpRequest) -> Result<(), HttpError> {
        self.state = TunnelState::Mcp;
        match request.header(SESSION_HEADER) {
            Some(id) => {
                self.ctx.sessions.remove(id).await;
                self.writer.send_response(&Response::empty(204)).await
            }
            None => {
                let response = Response::json(400, &McpError::invalid_request().envelope(None));
                self.writer.send_response(&response).await
            }
        }
    }
}

fn preflight() -> Response {
    Response::empty(204)
        .with_header("Access-Control-Allow-Origin", "*")
        .with_header("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS")
        .with_header(
            "Access-Control-Allow-Headers",
            format!("Content-Type, Authorization, {}", SESSION_HEADER),
        )
        .with_header("Access-Control-Max-Age", "86400")
}
