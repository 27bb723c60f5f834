//! Upstream LLM layer
//!
//! Neutral chat types, the streaming client for OpenAI-compatible
//! providers, reassembly of their chunk stream, and the audit trail.

pub mod assembler;
pub mod audit;
pub mod client;
pub mod types;

pub use assembler::{StreamAssembler, StreamEvent, THINK_CLOSE, THINK_OPEN};
pub use audit::{AuditLog, AuditRecord};
pub use client::{LlmClient, UpstreamStream};
pub use types::{
    new_call_id, ChatRequest, ContentPart, FinishReason, Message, MessageContent, Role, ToolCall,
    ToolSpec, Usage,
};
