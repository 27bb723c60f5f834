//! In-memory tool registry
//!
//! Tools are keyed by their exposed name, `<server>_<tool>`. Every mutation
//! that changes the contents bumps the revision and is broadcast, which the
//! session table turns into `notifications/tools/list_changed`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::llm::ToolSpec;

const CHANGE_QUEUE: usize = 16;

/// A tool exposed by one configured tool server
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredTool {
    /// Exposed name, `<server>_<tool>`
    pub name: String,
    pub server: String,
    /// Name on the owning server
    pub tool: String,
    pub description: Option<String>,
    pub input_schema: Option<Value>,
}

impl RegisteredTool {
    pub fn new(
        server: impl Into<String>,
        tool: impl Into<String>,
        description: Option<String>,
        input_schema: Option<Value>,
    ) -> Self {
        let server = server.into();
        let tool = tool.into();
        Self {
            name: format!("{}_{}", server, tool),
            server,
            tool,
            description,
            input_schema,
        }
    }

    /// Schema to advertise; an empty object schema when none was declared
    pub fn schema(&self) -> Value {
        match &self.input_schema {
            Some(schema) if schema.is_object() => schema.clone(),
            _ => json!({"type": "object", "properties": {}}),
        }
    }

    /// Entry for an MCP `tools/list` result
    pub fn to_mcp(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description.clone().unwrap_or_default(),
            "inputSchema": self.schema(),
        })
    }

    pub fn to_spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.schema(),
        }
    }
}

pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, RegisteredTool>>,
    revision: AtomicU64,
    changes: broadcast::Sender<u64>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_QUEUE);
        Self {
            tools: RwLock::new(BTreeMap::new()),
            revision: AtomicU64::new(0),
            changes,
        }
    }

    /// Receive the new revision after every mutation
    pub fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Add or replace one tool
    pub fn add(&self, tool: RegisteredTool) {
        {
            let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
            if tools.get(&tool.name) == Some(&tool) {
                return;
            }
            tools.insert(tool.name.clone(), tool);
        }
        self.changed();
    }

    pub fn remove(&self, name: &str) -> Option<RegisteredTool> {
        let removed = self
            .tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if removed.is_some() {
            self.changed();
        }
        removed
    }

    /// Replace every tool of one server
    pub fn replace_server(&self, server: &str, replacement: Vec<RegisteredTool>) {
        let changed = {
            let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
            let before: Vec<RegisteredTool> = tools
                .values()
                .filter(|t| t.server == server)
                .cloned()
                .collect();
            tools.retain(|_, t| t.server != server);
            for tool in replacement {
                tools.insert(tool.name.clone(), tool);
            }
            let after: Vec<&RegisteredTool> = tools.values().filter(|t| t.server == server).collect();
            before.len() != after.len() || before.iter().zip(after).any(|(a, b)| a != b)
        };
        if changed {
            self.changed();
        }
    }

    /// Replace the whole registry
    pub fn replace_all(&self, replacement: Vec<RegisteredTool>) {
        let changed = {
            let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
            let next: BTreeMap<String, RegisteredTool> = replacement
                .into_iter()
                .map(|t| (t.name.clone(), t))
                .collect();
            let changed = *tools != next;
            *tools = next;
            changed
        };
        if changed {
            self.changed();
        }
    }

    pub fn get(&self, name: &str) -> Option<RegisteredTool> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Snapshot in name order
    pub fn list(&self) -> Vec<RegisteredTool> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn changed(&self) {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(revision, "tool registry changed");
        // No subscribers is fine
        let _ = self.changes.send(revision);
    }
}
