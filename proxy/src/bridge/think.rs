//! Reasoning presentation
//!
//! Tracks where one client-facing response is relative to the model's
//! reasoning and turns upstream reason/content pieces into what the client
//! sees. The state only moves forward: NotStarted, InProgress, Completed.

use crate::config::ThinkMode;

pub const FENCE_OPEN: &str = "```think\n";
pub const FENCE_CLOSE: &str = "\n```\n\n";
pub const MARKER_OPEN: &str = "<think>\n";
pub const MARKER_CLOSE: &str = "\n</think>\n\n";

/// Zero-width space used to break up backtick runs inside fenced reasoning
const ZWSP: char = '\u{200B}';

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ThinkState {
    NotStarted,
    InProgress,
    Completed,
}

/// Text bound for the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emission {
    /// For the dialect's reasoning field
    Reason(String),
    Content(String),
}

#[derive(Debug)]
pub struct ThinkTracker {
    mode: ThinkMode,
    state: ThinkState,
    /// Backticks seen in a row at the end of the last reasoning piece
    ticks: usize,
}

impl ThinkTracker {
    pub fn new(mode: ThinkMode) -> Self {
        Self {
            mode,
            state: ThinkState::NotStarted,
            ticks: 0,
        }
    }

    pub fn state(&self) -> ThinkState {
        self.state
    }

    pub fn mode(&self) -> ThinkMode {
        self.mode
    }

    /// A piece of reasoning
    pub fn reason(&mut self, text: &str) -> Vec<Emission> {
        let mut out = Vec::new();
        if text.is_empty() {
            return out;
        }
        match (self.state, self.mode) {
            (_, ThinkMode::Field) => {
                if self.state == ThinkState::NotStarted {
                    self.state = ThinkState::InProgress;
                }
                out.push(Emission::Reason(text.to_string()));
            }
            (ThinkState::Completed, _) => {
                tracing::debug!(len = text.len(), "dropping reasoning after it was closed");
            }
            (ThinkState::NotStarted, mode) => {
                self.state = ThinkState::InProgress;
                out.push(Emission::Content(open_marker(mode).to_string()));
                out.push(Emission::Content(self.escape(text)));
            }
            (ThinkState::InProgress, _) => {
                out.push(Emission::Content(self.escape(text)));
            }
        }
        out
    }

    /// The upstream signalled that reasoning is over
    pub fn reason_complete(&mut self) -> Vec<Emission> {
        self.close()
    }

    /// A piece of answer text
    pub fn content(&mut self, text: &str) -> Vec<Emission> {
        if text.is_empty() {
            return Vec::new();
        }
        let mut out = match self.state {
            // Answer without any reasoning: no markers at all
            ThinkState::NotStarted => {
                self.state = ThinkState::Completed;
                Vec::new()
            }
            ThinkState::InProgress => self.close(),
            ThinkState::Completed => Vec::new(),
        };
        out.push(Emission::Content(text.to_string()));
        out
    }

    /// End of the response; closes a reasoning block left open
    pub fn finish(&mut self) -> Vec<Emission> {
        self.close()
    }

    fn close(&mut self) -> Vec<Emission> {
        if self.state != ThinkState::InProgress {
            return Vec::new();
        }
        self.state = ThinkState::Completed;
        self.ticks = 0;
        match self.mode {
            ThinkMode::Field => Vec::new(),
            mode => vec![Emission::Content(close_marker(mode).to_string())],
        }
    }

    /// Fenced mode: no three backticks in a row may reach the client, or
    /// the reasoning text could end the fence early.
    fn escape(&mut self, text: &str) -> String {
        if self.mode != ThinkMode::Fenced {
            return text.to_string();
        }
        let mut out = String::with_capacity(text.len());
        for ch in text.chars() {
            if ch == '`' {
                self.ticks += 1;
                if self.ticks == 3 {
                    out.push(ZWSP);
                    self.ticks = 1;
                }
            } else {
                self.ticks = 0;
            }
            out.push(ch);
        }
        out
    }
}

fn open_marker(mode: ThinkMode) -> &'static str {
    match mode {
        ThinkMode::Fenced => FENCE_OPEN,
        ThinkMode::Marker => MARKER_OPEN,
        ThinkMode::Field => "",
    }
}

fn close_marker(mode: ThinkMode) -> &'static str {
    match mode {
        ThinkMode::Fenced => FENCE_CLOSE,
        ThinkMode::Marker => MARKER_CLOSE,
        ThinkMode::Field => "",
    }
}
