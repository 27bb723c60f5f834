//! MCP JSON-RPC dispatch
//!
//! Parses one POSTed message and answers it against the tool registry.
//! HTTP status selection lives with the caller; this module only says
//! whether the message produced a body, was accepted silently, or was
//! rejected before dispatch.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::registry::ToolRegistry;
use super::runner::ToolInvoker;
use crate::error::McpError;

/// Protocol version answered when the client does not ask for one
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-06-18";

/// A parsed JSON-RPC message
#[derive(Debug, Clone, PartialEq)]
pub struct McpRequest {
    pub id: Option<Value>,
    pub method: String,
    pub params: Value,
}

impl McpRequest {
    /// Malformed JSON, a non-object body or a missing `method` are all
    /// reported as an invalid request.
    pub fn parse(body: &[u8]) -> Result<Self, McpError> {
        let value: Value = serde_json::from_slice(body).map_err(|_| McpError::invalid_request())?;
        let object = value.as_object().ok_or_else(McpError::invalid_request)?;
        let method = object
            .get("method")
            .and_then(|m| m.as_str())
            .ok_or_else(McpError::invalid_request)?
            .to_string();
        Ok(Self {
            id: object.get("id").filter(|id| !id.is_null()).cloned(),
            method,
            params: object.get("params").cloned().unwrap_or(Value::Null),
        })
    }

    /// Id-less messages and `notifications/*` get no response body
    pub fn is_notification(&self) -> bool {
        self.id.is_none() || self.method.starts_with("notifications/")
    }
}

/// What to send back for one message
#[derive(Debug, Clone, PartialEq)]
pub enum McpReply {
    /// 200 with this JSON-RPC envelope
    Body(Value),
    /// 202, empty body
    Accepted,
}

/// The embedded MCP server
#[derive(Clone)]
pub struct McpServer {
    registry: Arc<ToolRegistry>,
    invoker: Arc<dyn ToolInvoker>,
}

impl McpServer {
    pub fn new(registry: Arc<ToolRegistry>, invoker: Arc<dyn ToolInvoker>) -> Self {
        Self { registry, invoker }
    }

    pub async fn handle(&self, request: &McpRequest, cancel: &CancellationToken) -> McpReply {
        if request.is_notification() {
            tracing::debug!(method = %request.method, "MCP notification");
            return McpReply::Accepted;
        }

        let id = request.id.as_ref();
        let outcome = match request.method.as_str() {
            "initialize" => Ok(self.initialize(&request.params)),
            "tools/list" => Ok(self.list_tools()),
            "tools/call" => self.call_tool(&request.params, cancel).await,
            "ping" => Ok(json!({})),
            other => Err(McpError::method_not_found(other)),
        };

        match outcome {
            Ok(result) => McpReply::Body(json!({
                "jsonrpc": "2.0",
                "id": id.cloned().unwrap_or(Value::Null),
                "result": result,
            })),
            Err(e) => {
                tracing::debug!(method = %request.method, code = e.code, "MCP request rejected");
                McpReply::Body(e.envelope(id))
            }
        }
    }

    fn initialize(&self, params: &Value) -> Value {
        let version = params
            .get("protocolVersion")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_PROTOCOL_VERSION);
        json!({
            "protocolVersion": version,
            "capabilities": {
                "tools": {"listChanged": true},
            },
            "serverInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        })
    }

    fn list_tools(&self) -> Value {
        let tools: Vec<Value> = self.registry.list().iter().map(|t| t.to_mcp()).collect();
        json!({"tools": tools})
    }

    async fn call_tool(&self, params: &Value, cancel: &CancellationToken) -> Result<Value, McpError> {
        let name = params
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| McpError::invalid_params("missing tool name"))?;
        let tool = self
            .registry
            .get(name)
            .ok_or_else(|| McpError::invalid_params(format!("Unknown tool: {}", name)))?;
        let arguments = params
            .get("arguments")
            .cloned()
            .filter(|a| a.is_object())
            .unwrap_or_else(|| json!({}));

        let (text, is_error) = match self
            .invoker
            .invoke(&tool.server, &tool.tool, arguments, cancel)
            .await
        {
            Ok(text) => (text, false),
            Err(e) => {
                tracing::warn!(tool = %name, "MCP tool call failed: {}", e);
                (e.to_string(), true)
            }
        };

        Ok(json!({
            "content": [{"type": "text", "text": text}],
            "isError": is_error,
        }))
    }
}
