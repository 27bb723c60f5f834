//! Local chat-completion proxy
//!
//! Speaks the OpenAI chat, OpenAI responses and Anthropic messages dialects
//! to editors, forwards to an OpenAI-compatible upstream, runs registered
//! tools in a loop and exposes the same tools over an embedded MCP endpoint.

pub mod bridge;
pub mod config;
pub mod error;
pub mod extract;
pub mod http;
pub mod llm;
pub mod logging;
pub mod mcp;
pub mod server;
pub mod tunnel;
