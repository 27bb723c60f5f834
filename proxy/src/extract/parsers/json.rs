//! JSON tool-call body
//!
//! `{"name": "...", "arguments": {...}}`. `parameters` is accepted in place
//! of `arguments`, and string-encoded arguments are decoded.

use serde::Deserialize;
use serde_json::Value;

use super::{ParsedCall, ToolCallParser};

pub struct JsonCallParser;

#[derive(Deserialize)]
struct JsonFormat {
    name: String,
    #[serde(default, alias = "parameters")]
    arguments: Value,
}

impl ToolCallParser for JsonCallParser {
    fn parse(&self, body: &str) -> Option<ParsedCall> {
        let parsed: JsonFormat = serde_json::from_str(body).ok()?;

        let arguments = match parsed.arguments {
            Value::Null => Value::Object(Default::default()),
            Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
            other => other,
        };

        Some(ParsedCall {
            name: parsed.name,
            arguments,
        })
    }

    fn name(&self) -> &'static str {
        "JsonCallParser"
    }

    fn priority(&self) -> u32 {
        100
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let call = JsonCallParser
            .parse(r#"{"name": "get_weather", "arguments": {"city": "NYC"}}"#)
            .unwrap();
        assert_eq!(call.name, "get_weather");
        assert_eq!(call.arguments["city"], "NYC");
    }

    #[test]
    fn test_parse_parameters_alias_and_missing_args() {
        let call = JsonCallParser
            .parse(r#"{"name": "lookup", "parameters": {"q": 1}}"#)
            .unwrap();
        assert_eq!(call.arguments["q"], 1);

        let call = JsonCallParser.parse(r#"{"name": "ping"}"#).unwrap();
        assert!(call.arguments.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_parse_string_encoded_arguments() {
        let call = JsonCallParser
            .parse(r#"{"name": "read", "arguments": "{\"path\": \"/tmp\"}"}"#)
            .unwrap();
        assert_eq!(call.arguments["path"], "/tmp");
    }

    #[test]
    fn test_parse_invalid() {
        assert!(JsonCallParser.parse(r#"{"arguments": {}}"#).is_none());
        assert!(JsonCallParser.parse(r#"{"tool": "x"}"#).is_none());
        assert!(JsonCallParser.parse("not json").is_none());
    }
}
