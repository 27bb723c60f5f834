//! Tool execution
//!
//! Every call gets a fresh connection to its tool server: local servers are
//! spawned per call over stdio, remote servers get a new MCP session over
//! HTTP. The whole exchange races the server's timeout and the caller's
//! cancellation; a spawned process is killed on every exit path.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParam, CallToolResult, RawContent},
    transport::TokioChildProcess,
    RoleClient, ServiceExt,
};
use serde_json::{json, Value};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::registry::RegisteredTool;
use crate::config::{ConfigHandle, ToolServerConfig, ToolTransport};
use crate::error::ToolError;
use crate::http::SseDecoder;

/// Protocol version sent when this proxy acts as an MCP client
const CLIENT_PROTOCOL_VERSION: &str = "2025-06-18";

/// Executes one tool on one server
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Run `tool` on `server` and return the first text block of its result.
    async fn invoke(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<String, ToolError>;
}

/// Runs tools against the configured tool servers
#[derive(Clone)]
pub struct ToolRunner {
    config: ConfigHandle,
    http: reqwest::Client,
}

impl ToolRunner {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn server(&self, server: &str) -> Result<(ToolServerConfig, ToolTransport), ToolError> {
        let config = self.config.current();
        let entry = config
            .mcp_servers
            .get(server)
            .cloned()
            .ok_or_else(|| ToolError::UnknownServer(server.to_string()))?;
        let transport = entry.transport(server).map_err(|e| ToolError::Spawn {
            server: server.to_string(),
            message: e.to_string(),
        })?;
        Ok((entry, transport))
    }

    /// List the tools one server offers, named for the registry
    pub async fn list_tools(&self, server: &str) -> Result<Vec<RegisteredTool>, ToolError> {
        let (entry, transport) = self.server(server)?;
        let timeout = entry.timeout();

        let listing = self.list_once(server, &transport);

        tokio::time::timeout(timeout, listing)
            .await
            .map_err(|_| ToolError::Timeout {
                tool: format!("{}/tools/list", server),
                secs: timeout.as_secs(),
            })?
    }

    async fn list_once(
        &self,
        server: &str,
        transport: &ToolTransport,
    ) -> Result<Vec<RegisteredTool>, ToolError> {
        match transport {
            ToolTransport::Local { command, args, env } => {
                let service = spawn_local(server, command, args, env).await?;
                let listed = service.list_tools(Default::default()).await;
                let _ = service.cancel().await;
                let listed = listed.map_err(|e| ToolError::Transport {
                    server: server.to_string(),
                    message: e.to_string(),
                })?;
                Ok(listed
                    .tools
                    .into_iter()
                    .map(|t| {
                        RegisteredTool::new(
                            server,
                            t.name.to_string(),
                            t.description.map(|d| d.to_string()),
                            serde_json::to_value(&*t.input_schema).ok(),
                        )
                    })
                    .collect())
            }
            ToolTransport::Remote { url, headers } => {
                let mut session = RemoteSession::new(self.http.clone(), server, url, headers);
                session.initialize().await?;
                let result = session.request("tools/list", json!({})).await?;
                Ok(parse_remote_tools(server, &result))
            }
        }
    }

    async fn call_once(
        &self,
        server: &str,
        transport: &ToolTransport,
        tool: &str,
        arguments: Value,
    ) -> Result<String, ToolError> {
        match transport {
            ToolTransport::Local { command, args, env } => {
                call_local(server, command, args, env, tool, arguments).await
            }
            ToolTransport::Remote { url, headers } => {
                let mut session = RemoteSession::new(self.http.clone(), server, url, headers);
                session.initialize().await?;
                let result = session
                    .request("tools/call", json!({"name": tool, "arguments": arguments}))
                    .await?;
                remote_result_text(tool, &result)
            }
        }
    }
}

#[async_trait]
impl ToolInvoker for ToolRunner {
    async fn invoke(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<String, ToolError> {
        let (entry, transport) = self.server(server)?;
        let timeout = entry.timeout();
        let started = std::time::Instant::now();

        let call = self.call_once(server, &transport, tool, arguments);

        // Dropping `call` drops the child process handle, which kills it
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ToolError::Cancelled),
            outcome = tokio::time::timeout(timeout, call) => match outcome {
                Ok(result) => result,
                Err(_) => Err(ToolError::Timeout {
                    tool: tool.to_string(),
                    secs: timeout.as_secs(),
                }),
            },
        };

        tracing::info!(
            server,
            tool,
            duration_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "tool call finished"
        );
        result
    }
}

/// Directory of the resolved executable goes first on PATH
fn augmented_path(executable: &Path) -> Option<std::ffi::OsString> {
    let dir = executable.parent()?;
    let mut paths: Vec<PathBuf> = vec![dir.to_path_buf()];
    if let Some(existing) = std::env::var_os("PATH") {
        paths.extend(std::env::split_paths(&existing).filter(|p| p != dir));
    }
    std::env::join_paths(paths).ok()
}

async fn spawn_local(
    server: &str,
    command: &str,
    args: &[String],
    env: &[(String, String)],
) -> Result<rmcp::service::RunningService<RoleClient, ()>, ToolError> {
    let spawn_err = |message: String| ToolError::Spawn {
        server: server.to_string(),
        message,
    };

    let executable = which::which(command).map_err(|e| spawn_err(format!("{}: {}", command, e)))?;

    let mut cmd = Command::new(&executable);
    cmd.args(args).kill_on_drop(true).stderr(Stdio::null());
    for (key, value) in env {
        cmd.env(key, value);
    }
    if !env.iter().any(|(k, _)| k == "PATH") {
        if let Some(path) = augmented_path(&executable) {
            cmd.env("PATH", path);
        }
    }

    tracing::debug!(server, executable = %executable.display(), "spawning tool server");
    let transport = TokioChildProcess::new(cmd).map_err(|e| spawn_err(e.to_string()))?;
    ().serve(transport)
        .await
        .map_err(|e| spawn_err(e.to_string()))
}

async fn call_local(
    server: &str,
    command: &str,
    args: &[String],
    env: &[(String, String)],
    tool: &str,
    arguments: Value,
) -> Result<String, ToolError> {
    let service = spawn_local(server, command, args, env).await?;

    let result = service
        .call_tool(CallToolRequestParam {
            name: tool.to_string().into(),
            arguments: arguments.as_object().cloned(),
            task: None,
        })
        .await;
    let _ = service.cancel().await;

    let result = result.map_err(|e| ToolError::Transport {
        server: server.to_string(),
        message: e.to_string(),
    })?;
    local_result_text(tool, &result)
}

fn local_result_text(tool: &str, result: &CallToolResult) -> Result<String, ToolError> {
    let text = result
        .content
        .iter()
        .find_map(|c| match &c.raw {
            RawContent::Text(t) => Some(t.text.clone()),
            _ => None,
        })
        .unwrap_or_default();

    if result.is_error.unwrap_or(false) {
        return Err(ToolError::Failed {
            tool: tool.to_string(),
            message: text,
        });
    }
    Ok(text)
}

fn remote_result_text(tool: &str, result: &Value) -> Result<String, ToolError> {
    let text = result
        .get("content")
        .and_then(|c| c.as_array())
        .and_then(|blocks| {
            blocks.iter().find_map(|b| {
                (b.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .then(|| b.get("text").and_then(|t| t.as_str()))
                    .flatten()
            })
        })
        .unwrap_or_default()
        .to_string();

    if result.get("isError").and_then(|e| e.as_bool()).unwrap_or(false) {
        return Err(ToolError::Failed {
            tool: tool.to_string(),
            message: text,
        });
    }
    Ok(text)
}

fn parse_remote_tools(server: &str, result: &Value) -> Vec<RegisteredTool> {
    result
        .get("tools")
        .and_then(|t| t.as_array())
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| {
                    let name = t.get("name")?.as_str()?;
                    Some(RegisteredTool::new(
                        server,
                        name,
                        t.get("description").and_then(|d| d.as_str()).map(str::to_owned),
                        t.get("inputSchema").cloned(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// One MCP session against a remote streamable-HTTP server
struct RemoteSession<'a> {
    http: reqwest::Client,
    server: &'a str,
    url: &'a str,
    headers: &'a [(String, String)],
    session_id: Option<String>,
    next_id: u64,
}

impl<'a> RemoteSession<'a> {
    fn new(
        http: reqwest::Client,
        server: &'a str,
        url: &'a str,
        headers: &'a [(String, String)],
    ) -> Self {
        Self {
            http,
            server,
            url,
            headers,
            session_id: None,
            next_id: 1,
        }
    }

    fn transport_err(&self, message: impl Into<String>) -> ToolError {
        ToolError::Transport {
            server: self.server.to_string(),
            message: message.into(),
        }
    }

    async fn initialize(&mut self) -> Result<(), ToolError> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": CLIENT_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION")},
            }),
        )
        .await?;
        self.post(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await?;
        Ok(())
    }

    /// Send a request and return its `result`
    async fn request(&mut self, method: &str, params: Value) -> Result<Value, ToolError> {
        let id = self.next_id;
        self.next_id += 1;
        let reply = self
            .post(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await?
            .ok_or_else(|| self.transport_err(format!("no reply to {}", method)))?;

        if let Some(error) = reply.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return Err(self.transport_err(format!("{} failed: {}", method, message)));
        }
        Ok(reply.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn post(&mut self, message: Value) -> Result<Option<Value>, ToolError> {
        let mut request = self
            .http
            .post(self.url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .json(&message);
        for (name, value) in self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(session_id) = &self.session_id {
            request = request.header("Mcp-Session-Id", session_id.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.transport_err(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(self.transport_err(format!("HTTP {}", status)));
        }

        if let Some(id) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(id.to_string());
        }
        let event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);

        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_err(e.to_string()))?;
        if body.is_empty() {
            return Ok(None);
        }
        if event_stream {
            return Ok(first_response_in_sse(&body));
        }
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| self.transport_err(format!("invalid JSON reply: {}", e)))
    }
}

/// First JSON-RPC response (not notification) in an SSE body
fn first_response_in_sse(body: &[u8]) -> Option<Value> {
    let mut decoder = SseDecoder::new();
    let mut events = decoder.push(body);
    events.extend(decoder.finish());
    events
        .into_iter()
        .filter_map(|e| serde_json::from_str::<Value>(&e.data).ok())
        .find(|v| v.get("result").is_some() || v.get("error").is_some())
}

/// Split an exposed `<server>_<tool>` name against the configured servers.
/// The longest matching server name wins.
pub fn split_tool_name<'a>(name: &'a str, servers: &[&str]) -> Option<(String, &'a str)> {
    servers
        .iter()
        .filter_map(|server| {
            let rest = name.strip_prefix(server)?.strip_prefix('_')?;
            (!rest.is_empty()).then(|| (server.to_string(), rest))
        })
        .max_by_key(|(server, _)| server.len())
}
