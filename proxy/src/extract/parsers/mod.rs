//! Tool-call body parsers
//!
//! Models without native tool calling write the call between tool-call
//! delimiters in their content. The body comes in different shapes depending
//! on the model; each parser handles one shape and the registry tries them in
//! priority order.

use serde_json::Value;

mod json;
mod xml_function;

pub use json::JsonCallParser;
pub use xml_function::XmlFunctionParser;

/// A call recovered from a tool-call body
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCall {
    pub name: String,
    pub arguments: Value,
}

/// Trait for parsing one tool-call body format
pub trait ToolCallParser: Send + Sync {
    /// Returns `Some` if `body` is in this parser's format
    fn parse(&self, body: &str) -> Option<ParsedCall>;

    /// Parser name for logging
    fn name(&self) -> &'static str;

    /// Higher is tried first
    fn priority(&self) -> u32;
}

/// Registry of body parsers, tried highest priority first
pub struct ToolCallParserRegistry {
    parsers: Vec<Box<dyn ToolCallParser>>,
}

impl Default for ToolCallParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallParserRegistry {
    pub fn new() -> Self {
        let mut parsers: Vec<Box<dyn ToolCallParser>> =
            vec![Box::new(JsonCallParser), Box::new(XmlFunctionParser::new())];
        parsers.sort_by(|a, b| b.priority().cmp(&a.priority()));
        Self { parsers }
    }

    /// Parse a body, returning the call and the parser that matched
    pub fn parse(&self, body: &str) -> Option<(ParsedCall, &'static str)> {
        let body = body.trim();
        if body.is_empty() {
            return None;
        }
        self.parsers
            .iter()
            .find_map(|p| p.parse(body).map(|call| (call, p.name())))
    }

    pub fn parser_names(&self) -> Vec<&'static str> {
        self.parsers.iter().map(|p| p.name()).collect()
    }
}
