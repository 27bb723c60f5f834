//! XML function call body
//!
//! `<function=tool_name><parameter=key>value</parameter></function>`, as
//! written by qwen-style models. Empty bodies are allowed.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use super::{ParsedCall, ToolCallParser};

static FUNCTION_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"<function=([^>]+)>([\s\S]*?)</function>").ok());

static PARAM_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"<parameter=([^>]+)>([\s\S]*?)</parameter>").ok());

#[derive(Default)]
pub struct XmlFunctionParser;

impl XmlFunctionParser {
    pub fn new() -> Self {
        Self
    }
}

impl ToolCallParser for XmlFunctionParser {
    fn parse(&self, body: &str) -> Option<ParsedCall> {
        let function_re = FUNCTION_RE.as_ref()?;
        let param_re = PARAM_RE.as_ref()?;

        let caps = function_re.captures(body)?;
        let name = caps.get(1)?.as_str().trim().to_string();
        let inner = caps.get(2).map(|m| m.as_str()).unwrap_or("");

        let mut args = serde_json::Map::new();
        for param in param_re.captures_iter(inner) {
            if let (Some(key), Some(value)) = (param.get(1), param.get(2)) {
                let value = value.as_str().trim();
                // Scalars and nested JSON keep their type; anything else is a string
                let json_value = serde_json::from_str(value)
                    .unwrap_or_else(|_| Value::String(value.to_string()));
                args.insert(key.as_str().trim().to_string(), json_value);
            }
        }

        Some(ParsedCall {
            name,
            arguments: Value::Object(args),
        })
    }

    fn name(&self) -> &'static str {
        "XmlFunctionParser"
    }

    fn priority(&self) -> u32 {
        75
    }
}
