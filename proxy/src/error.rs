//! Error types for the proxy
//!
//! Each layer owns a `thiserror` enum; glue code and the binary use
//! `anyhow` with context on top of these.

use serde_json::{json, Value};

/// Errors raised while framing HTTP/1.1 traffic on a connection
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed request line: {0}")]
    BadRequestLine(String),

    #[error("malformed header line: {0}")]
    BadHeader(String),

    #[error("invalid Content-Length: {0}")]
    BadContentLength(String),

    #[error("malformed chunked body: {0}")]
    BadChunk(String),

    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("connection closed")]
    Closed,
}

/// Errors from the upstream LLM backend
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("upstream transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upstream reported an error: {0}")]
    Upstream(String),

    #[error("no provider configured for model '{0}'")]
    NoProvider(String),

    #[error("upstream call cancelled")]
    Cancelled,
}

/// Errors from executing a tool through a local or remote MCP server
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool server '{0}' is not configured")]
    UnknownServer(String),

    #[error("failed to start tool server '{server}': {message}")]
    Spawn { server: String, message: String },

    #[error("tool server '{server}' transport error: {message}")]
    Transport { server: String, message: String },

    #[error("tool '{tool}' timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    #[error("tool '{tool}' reported an error: {message}")]
    Failed { tool: String, message: String },

    #[error("tool call cancelled")]
    Cancelled,
}

/// Errors loading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("mcp server '{0}' needs either `command` or `url`")]
    IncompleteServer(String),
}

/// JSON-RPC error codes used by the MCP endpoint
pub mod codes {
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// A JSON-RPC error object
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("json-rpc error {code}: {message}")]
pub struct McpError {
    pub code: i64,
    pub message: String,
}

impl McpError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_request() -> Self {
        Self::new(codes::INVALID_REQUEST, "Invalid Request")
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    /// Full JSON-RPC error envelope for the given request id
    pub fn envelope(&self, id: Option<&Value>) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id.cloned().unwrap_or(Value::Null),
            "error": {
                "code": self.code,
                "message": self.message,
            }
        })
    }
}

impl From<ToolError> for McpError {
    fn from(e: ToolError) -> Self {
        McpError::internal(e.to_string())
    }
}
