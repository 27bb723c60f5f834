//! Streaming tool-call extraction
//!
//! Splits in-content tool-call markup from plain text as fragments arrive.
//! Either delimiter may be split across fragment boundaries; a partial
//! delimiter is held back until the next fragment decides it.

pub mod parsers;

pub use parsers::{ParsedCall, ToolCallParserRegistry};

/// Opening delimiter for in-content tool calls
pub const TOOL_CALL_OPEN: &str = "<tool_call>";
/// Closing delimiter for in-content tool calls
pub const TOOL_CALL_CLOSE: &str = "</tool_call>";

/// Plain text preceding an (optional) extracted call body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub text: String,
    pub call: Option<String>,
}

/// Incremental scanner for delimited tool-call blocks
#[derive(Debug, Clone)]
pub struct ToolCallExtractor {
    open: String,
    close: String,
    inside: bool,
    pending: String,
}

impl Default for ToolCallExtractor {
    fn default() -> Self {
        Self::new(TOOL_CALL_OPEN, TOOL_CALL_CLOSE)
    }
}

impl ToolCallExtractor {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
            inside: false,
            pending: String::new(),
        }
    }

    /// Whether an opening delimiter has been seen without its close
    pub fn in_call(&self) -> bool {
        self.inside
    }

    /// Process one fragment, returning segments in order.
    pub fn push(&mut self, fragment: &str) -> Vec<Segment> {
        let mut buf = std::mem::take(&mut self.pending);
        buf.push_str(fragment);

        let mut segments = Vec::new();
        let mut text = String::new();
        let mut rest = buf.as_str();

        loop {
            if self.inside {
                match rest.find(self.close.as_str()) {
                    Some(idx) => {
                        segments.push(Segment {
                            text: std::mem::take(&mut text),
                            call: Some(rest[..idx].to_string()),
                        });
                        rest = &rest[idx + self.close.len()..];
                        self.inside = false;
                    }
                    None => {
                        self.pending = rest.to_string();
                        break;
                    }
                }
            } else {
                match rest.find(self.open.as_str()) {
                    Some(idx) => {
                        text.push_str(&rest[..idx]);
                        rest = &rest[idx + self.open.len()..];
                        self.inside = true;
                    }
                    None => {
                        let hold = partial_suffix(rest, &self.open);
                        let split = rest.len() - hold;
                        text.push_str(&rest[..split]);
                        self.pending = rest[split..].to_string();
                        break;
                    }
                }
            }
        }

        if !text.is_empty() {
            segments.push(Segment { text, call: None });
        }
        segments
    }

    /// End of stream: anything still buffered is returned as plain text,
    /// including an unterminated opening delimiter and its body.
    pub fn flush(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        if std::mem::replace(&mut self.inside, false) {
            format!("{}{}", self.open, pending)
        } else {
            pending
        }
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `delim`
fn partial_suffix(text: &str, delim: &str) -> usize {
    let max = delim.len().saturating_sub(1).min(text.len());
    (1..=max)
        .rev()
        .find(|&k| {
            let start = text.len() - k;
            text.is_char_boundary(start) && delim.starts_with(&text[start..])
        })
        .unwrap_or(0)
}
