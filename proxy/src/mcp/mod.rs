//! Embedded MCP server and tool execution
//!
//! - `registry`: tools exposed as `<server>_<tool>`, with a change feed
//! - `session`: session table actor delivering list-changed notices
//! - `protocol`: JSON-RPC dispatch for `POST /mcp`
//! - `runner`: executes tools on local (stdio) or remote (HTTP) servers
//! - `discovery`: fills the registry from the configured servers

pub mod discovery;
pub mod protocol;
pub mod registry;
pub mod runner;
pub mod session;

pub use discovery::discover;
pub use protocol::{McpReply, McpRequest, McpServer, DEFAULT_PROTOCOL_VERSION};
pub use registry::{RegisteredTool, ToolRegistry};
pub use runner::{split_tool_name, ToolInvoker, ToolRunner};
pub use session::{Notice, SessionHandle, SessionInfo, SessionTable, TunnelId};
