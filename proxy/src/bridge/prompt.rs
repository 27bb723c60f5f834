//! Derivation of the upstream conversation
//!
//! The client's conversation is never sent verbatim. Each upstream call gets
//! a derived copy: prior reasoning markup is stripped from assistant turns,
//! tool output is trimmed, a forced output language is appended to the last
//! user turn, and for providers without native tool calling the tool
//! catalogue is written into the system prompt while calls and results are
//! rendered as text.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Value};

use crate::extract::{TOOL_CALL_CLOSE, TOOL_CALL_OPEN};
use crate::llm::{ChatRequest, ContentPart, Message, MessageContent, Role, ToolCall, ToolSpec};

/// Lines kept around each search-key hit in a truncated code block
const CONTEXT_LINES: usize = 2;

/// Shortest argument token used as a search key
const MIN_KEY_LEN: usize = 3;

static THINK_BLOCK: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?s)<think>.*?</think>\s*|```think\n.*?\n```\n*")
        .map_err(|e| tracing::error!("invalid think pattern: {}", e))
        .ok()
});

static CODE_BLOCK: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?s)```([^\n`]*)\n(.*?)\n```")
        .map_err(|e| tracing::error!("invalid code block pattern: {}", e))
        .ok()
});

/// Settings one derivation needs
#[derive(Debug, Clone, Default)]
pub struct PromptOptions {
    /// Provider accepts a `tools` array
    pub native_tools: bool,
    pub output_language: Option<String>,
    pub max_code_block_chars: usize,
}

/// Remove reasoning markup a previous response carried
pub fn strip_think(text: &str) -> String {
    match THINK_BLOCK.as_ref() {
        Some(re) if text.contains("think") => re.replace_all(text, "").into_owned(),
        _ => text.to_string(),
    }
}

/// Textual tool catalogue for providers without native tool calling
pub fn tool_catalogue(tools: &[ToolSpec]) -> String {
    let mut out = String::from(
        "# Tools\n\nYou can call the following tools. To call one, reply with exactly\n",
    );
    out.push_str(&format!(
        "{}{{\"name\": \"<tool name>\", \"arguments\": {{...}}}}{}\n",
        TOOL_CALL_OPEN, TOOL_CALL_CLOSE
    ));
    out.push_str("and wait for the result before continuing.\n");
    for tool in tools {
        out.push_str(&format!("\n## {}\n", tool.name));
        if let Some(description) = tool.description.as_deref().filter(|d| !d.is_empty()) {
            out.push_str(description);
            out.push('\n');
        }
        out.push_str(&format!("Parameters: {}\n", tool.parameters));
    }
    out
}

pub fn process_system_prompt(text: &str, catalogue: Option<&str>) -> String {
    match catalogue {
        Some(catalogue) if text.trim().is_empty() => catalogue.to_string(),
        Some(catalogue) => format!("{}\n\n{}", text.trim_end(), catalogue),
        None => text.to_string(),
    }
}

pub fn process_user_content(text: &str, language: Option<&str>) -> String {
    match language.filter(|l| !l.trim().is_empty()) {
        Some(language) => format!("{}\n\nRespond in {}.", text, language.trim()),
        None => text.to_string(),
    }
}

pub fn process_assistant_content(text: &str) -> String {
    strip_think(text)
}

/// Human-readable block for one tool result
pub fn tool_result_block(name: &str, ok: bool, output: &str) -> String {
    format!(
        "<tool_result name=\"{}\" status=\"{}\">\n{}\n</tool_result>\n",
        name,
        if ok { "ok" } else { "failed" },
        output
    )
}

/// Lowercased string tokens from the arguments of the given calls
pub fn search_keys(calls: &[ToolCall]) -> Vec<String> {
    fn walk(value: &Value, keys: &mut BTreeSet<String>) {
        match value {
            Value::String(s) => {
                for token in s.split(|c: char| !c.is_alphanumeric() && c != '_') {
                    if token.chars().count() >= MIN_KEY_LEN {
                        keys.insert(token.to_lowercase());
                    }
                }
            }
            Value::Array(items) => items.iter().for_each(|v| walk(v, keys)),
            Value::Object(map) => map.values().for_each(|v| walk(v, keys)),
            _ => {}
        }
    }

    let mut keys = BTreeSet::new();
    for call in calls {
        walk(&call.arguments_json(), &mut keys);
    }
    keys.into_iter().collect()
}

/// Shorten every fenced code block longer than `max` characters.
///
/// Lines containing a search key are kept with a little context; without
/// keys or without a hit the block is cut at `max`.
pub fn truncate_code_blocks(text: &str, keys: &[String], max: usize) -> String {
    let Some(re) = CODE_BLOCK.as_ref() else {
        return text.to_string();
    };
    if max == 0 || !text.contains("```") {
        return text.to_string();
    }
    re.replace_all(text, |caps: &regex::Captures| {
        let lang = caps.get(1).map_or("", |m| m.as_str());
        let body = caps.get(2).map_or("", |m| m.as_str());
        if body.chars().count() <= max {
            return caps[0].to_string();
        }
        let shortened = keep_matching_lines(body, keys, max).unwrap_or_else(|| cut(body, max));
        format!("```{}\n{}\n```", lang, shortened)
    })
    .into_owned()
}

fn keep_matching_lines(body: &str, keys: &[String], max: usize) -> Option<String> {
    if keys.is_empty() {
        return None;
    }
    let lines: Vec<&str> = body.lines().collect();
    let mut keep = vec![false; lines.len()];
    let mut hit = false;
    for (i, line) in lines.iter().enumerate() {
        let lower = line.to_lowercase();
        if keys.iter().any(|k| lower.contains(k.as_str())) {
            hit = true;
            let from = i.saturating_sub(CONTEXT_LINES);
            let to = (i + CONTEXT_LINES).min(lines.len() - 1);
            keep[from..=to].iter_mut().for_each(|k| *k = true);
        }
    }
    if !hit {
        return None;
    }

    let mut out: Vec<String> = Vec::new();
    let mut skipped = 0usize;
    for (line, kept) in lines.iter().zip(&keep) {
        if *kept {
            if skipped > 0 {
                out.push(format!("... ({} lines omitted)", skipped));
                skipped = 0;
            }
            out.push(line.to_string());
        } else {
            skipped += 1;
        }
    }
    if skipped > 0 {
        out.push(format!("... ({} lines omitted)", skipped));
    }

    let joined = out.join("\n");
    if joined.chars().count() > max {
        return Some(cut(&joined, max));
    }
    Some(joined)
}

fn cut(text: &str, max: usize) -> String {
    let total = text.chars().count();
    let kept: String = text.chars().take(max).collect();
    format!("{}\n... (truncated {} characters)", kept, total - max.min(total))
}

/// Build the derived conversation for one upstream call
pub fn derive(conversation: &ChatRequest, tools: &[ToolSpec], options: &PromptOptions) -> ChatRequest {
    let catalogue = (!options.native_tools && !tools.is_empty()).then(|| tool_catalogue(tools));
    let last_user = conversation.messages.iter().rposition(|m| m.role == Role::User);

    let mut messages: Vec<Message> = Vec::with_capacity(conversation.messages.len() + 1);
    let mut catalogue_placed = false;
    let mut keys: Vec<String> = Vec::new();
    // Consecutive tool results are merged into one user turn for text-only providers
    let mut pending_results: Vec<String> = Vec::new();

    for (index, message) in conversation.messages.iter().enumerate() {
        if message.role != Role::Tool && !pending_results.is_empty() {
            messages.push(Message::text(Role::User, pending_results.concat()));
            pending_results.clear();
        }

        match message.role {
            Role::System | Role::Developer => {
                let mut derived = message.clone();
                if !catalogue_placed {
                    derived.content = message
                        .content
                        .map_text(|t| process_system_prompt(t, catalogue.as_deref()));
                    catalogue_placed = catalogue.is_some();
                }
                messages.push(derived);
            }
            Role::User => {
                let mut derived = message.clone();
                if Some(index) == last_user {
                    derived.content = append_to_last_text(&message.content, |t| {
                        process_user_content(t, options.output_language.as_deref())
                    });
                }
                messages.push(derived);
            }
            Role::Assistant => {
                keys = search_keys(&message.tool_calls);
                let text = process_assistant_content(&message.content.text());
                if options.native_tools {
                    messages.push(Message {
                        role: Role::Assistant,
                        content: MessageContent::Text(text),
                        tool_calls: message.tool_calls.clone(),
                        ..Default::default()
                    });
                } else {
                    messages.push(Message::text(
                        Role::Assistant,
                        with_textual_calls(&text, &message.tool_calls),
                    ));
                }
            }
            Role::Tool => {
                let output = truncate_code_blocks(
                    &message.content.text(),
                    &keys,
                    options.max_code_block_chars,
                );
                if options.native_tools {
                    messages.push(Message {
                        content: MessageContent::Text(output),
                        ..message.clone()
                    });
                } else {
                    let name = message.name.as_deref().unwrap_or("tool");
                    pending_results.push(tool_result_block(name, true, &output));
                }
            }
        }
    }
    if !pending_results.is_empty() {
        messages.push(Message::text(Role::User, pending_results.concat()));
    }

    if let (Some(catalogue), false) = (catalogue, catalogue_placed) {
        messages.insert(0, Message::text(Role::System, catalogue));
    }

    ChatRequest {
        messages,
        ..conversation.clone()
    }
}

/// Upstream body for a derived conversation
pub fn upstream_body(derived: &ChatRequest, tools: &[ToolSpec], options: &PromptOptions) -> Value {
    if options.native_tools {
        derived.to_upstream_body(tools)
    } else {
        derived.to_upstream_body(&[])
    }
}

/// Messages recording one executed tool round
pub fn fold_round(content: &str, calls: &[ToolCall], results: &[(ToolCall, String)]) -> Vec<Message> {
    let mut out = vec![Message::assistant_with_calls(content, calls.to_vec())];
    out.extend(
        results
            .iter()
            .map(|(call, output)| Message::tool_result(call, output.clone())),
    );
    out
}

fn with_textual_calls(text: &str, calls: &[ToolCall]) -> String {
    let mut out = text.to_string();
    for call in calls {
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        let body = json!({"name": call.name, "arguments": call.arguments_json()});
        out.push_str(&format!("{}{}{}", TOOL_CALL_OPEN, body, TOOL_CALL_CLOSE));
    }
    out
}

fn append_to_last_text(content: &MessageContent, f: impl Fn(&str) -> String) -> MessageContent {
    match content {
        MessageContent::Text(t) => MessageContent::Text(f(t)),
        MessageContent::Parts(parts) => {
            let last_text = parts.iter().rposition(|p| matches!(p, ContentPart::Text(_)));
            MessageContent::Parts(
                parts
                    .iter()
                    .enumerate()
                    .map(|(i, part)| match part {
                        ContentPart::Text(t) if Some(i) == last_text => ContentPart::Text(f(t)),
                        other => other.clone(),
                    })
                    .collect(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: Some(format!("{} things", name)),
            parameters: json!({"type": "object"}),
        }
    }

    fn call(name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: format!("call_{}", name),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }

    fn options(native_tools: bool) -> PromptOptions {
        PromptOptions {
            native_tools,
            output_language: None,
            max_code_block_chars: 4000,
        }
    }

    #[test]
    fn test_strip_think_both_markups() {
        assert_eq!(strip_think("<think>\nhmm\n</think>\n\nHello"), "Hello");
        assert_eq!(strip_think("```think\nhmm\n```\n\nHello"), "Hello");
        assert_eq!(strip_think("```rust\nfn x() {}\n```"), "```rust\nfn x() {}\n```");
    }

    #[test]
    fn test_language_goes_to_last_user_turn_only() {
        let conversation = ChatRequest {
            model: "m".into(),
            messages: vec![
                Message::text(Role::User, "first"),
                Message::text(Role::Assistant, "reply"),
                Message::text(Role::User, "second"),
            ],
            ..Default::default()
        };
        let opts = PromptOptions {
            output_language: Some("English".into()),
            ..options(true)
        };
        let derived = derive(&conversation, &[], &opts);
        assert_eq!(derived.messages[0].content.text(), "first");
        assert_eq!(derived.messages[2].content.text(), "second\n\nRespond in English.");
        // Original untouched
        assert_eq!(conversation.messages[2].content.text(), "second");
    }

    #[test]
    fn test_catalogue_for_text_only_provider() {
        let conversation = ChatRequest {
            model: "m".into(),
            messages: vec![
                Message::text(Role::System, "Be brief."),
                Message::text(Role::User, "hi"),
            ],
            ..Default::default()
        };
        let derived = derive(&conversation, &[spec("docs_search")], &options(false));
        let system = derived.messages[0].content.text();
        assert!(system.starts_with("Be brief.\n\n# Tools"));
        assert!(system.contains("## docs_search"));

        // No system message: one is inserted
        let conversation = ChatRequest {
            messages: vec![Message::text(Role::User, "hi")],
            ..conversation
        };
        let derived = derive(&conversation, &[spec("docs_search")], &options(false));
        assert_eq!(derived.messages[0].role, Role::System);
        assert_eq!(derived.messages.len(), 2);

        // Native provider: no catalogue
        let derived = derive(&conversation, &[spec("docs_search")], &options(true));
        assert_eq!(derived.messages.len(), 1);
    }

    #[test]
    fn test_text_only_provider_gets_textual_rounds() {
        let c = call("docs_search", r#"{"q": "alpha"}"#);
        let mut messages = vec![Message::text(Role::User, "find alpha")];
        messages.extend(fold_round("", &[c.clone()], &[(c.clone(), "found".into())]));
        let conversation = ChatRequest {
            model: "m".into(),
            messages,
            ..Default::default()
        };

        let derived = derive(&conversation, &[], &options(false));
        assert_eq!(derived.messages.len(), 3);
        assert!(derived.messages[1].tool_calls.is_empty());
        let text = derived.messages[1].content.text();
        assert!(text.starts_with("<tool_call>{") && text.ends_with("}</tool_call>"));
        assert!(text.contains("\"name\":\"docs_search\""));
        assert_eq!(derived.messages[2].role, Role::User);
        assert_eq!(
            derived.messages[2].content.text(),
            tool_result_block("docs_search", true, "found")
        );

        let derived = derive(&conversation, &[], &options(true));
        assert_eq!(derived.messages[1].tool_calls.len(), 1);
        assert_eq!(derived.messages[2].role, Role::Tool);
    }

    #[test]
    fn test_search_keys() {
        let keys = search_keys(&[call("s", r#"{"query": "parseConfig in main.rs", "n": 3, "x": ["ab"]}"#)]);
        assert_eq!(keys, vec!["main", "parseconfig"]);
    }

    #[test]
    fn test_truncate_keeps_matching_lines() {
        let mut body: Vec<String> = (0..50).map(|i| format!("line {}", i)).collect();
        body[25] = "fn parse_config() {".to_string();
        let text = format!("result:\n```rust\n{}\n```\ndone", body.join("\n"));

        let out = truncate_code_blocks(&text, &["parse_config".to_string()], 100);
        assert!(out.contains("line 23\nline 24\nfn parse_config() {\nline 26\nline 27"));
        assert!(out.contains("... (23 lines omitted)"));
        assert!(!out.contains("line 10\n"));
        assert!(out.starts_with("result:\n```rust\n"));
        assert!(out.ends_with("\n```\ndone"));
    }

    #[test]
    fn test_truncate_without_hit_cuts() {
        let text = format!("```\n{}\n```", "x".repeat(50));
        let out = truncate_code_blocks(&text, &["nothing".to_string()], 10);
        assert_eq!(out, format!("```\n{}\n... (truncated 40 characters)\n```", "x".repeat(10)));

        // Short blocks are untouched
        assert_eq!(truncate_code_blocks(&text, &[], 100), text);
    }
}
