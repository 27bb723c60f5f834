//! Server-Sent Events framing
//!
//! Encoding is used for every streaming response the proxy writes;
//! [`SseDecoder`] parses the upstream provider's event stream regardless of
//! how the bytes were split into network reads.

use memchr::memchr;

/// Payload of the terminal event on OpenAI-style streams
pub const DONE_PAYLOAD: &str = "[DONE]";

/// One SSE event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn done() -> Self {
        Self::data(DONE_PAYLOAD)
    }

    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_PAYLOAD
    }

    /// Wire form: optional `event:`/`id:` lines, one `data:` line per payload
    /// line, terminated by a blank line.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::with_capacity(self.data.len() + 16);
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out.into_bytes()
    }
}

/// Incremental SSE parser
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    id: Option<String>,
    data: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every event completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();
        let mut start = 0usize;

        while let Some(rel) = memchr(b'\n', &self.buf[start..]) {
            let end = start + rel;
            let mut line = &self.buf[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line).into_owned();
            start = end + 1;
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }

        self.buf.drain(..start);
        events
    }

    /// Flush at end of stream: an unterminated last line and any pending
    /// event are dispatched.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches('\r').to_string();
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };

        match field {
            "data" => match &mut self.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_string()),
            },
            "event" => self.event = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let id = self.id.take();
        let data = self.data.take()?;
        Some(SseEvent { event, id, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_data_only() {
        assert_eq!(SseEvent::data("{}").encode(), b"data: {}\n\n".to_vec());
        assert_eq!(SseEvent::done().encode(), b"data: [DONE]\n\n".to_vec());
    }

    #[test]
    fn test_encode_named_multiline() {
        let mut ev = SseEvent::named("message", "a\nb");
        ev.id = Some("7".to_string());
        assert_eq!(
            String::from_utf8(ev.encode()).unwrap(),
            "event: message\nid: 7\ndata: a\ndata: b\n\n"
        );
    }

    #[test]
    fn test_decode_round_trip() {
        let ev = SseEvent {
            event: Some("delta".to_string()),
            id: Some("1".to_string()),
            data: "line one\nline two".to_string(),
        };
        let mut dec = SseDecoder::new();
        assert_eq!(dec.push(&ev.encode()), vec![ev]);
    }

    #[test]
    fn test_decode_byte_by_byte_crlf_and_comments() {
        let raw = b": keepalive\r\ndata: {\"a\":1}\r\n\r\ndata:[DONE]\r\n\r\n";
        let mut dec = SseDecoder::new();
        let mut events = Vec::new();
        for b in raw.iter() {
            events.extend(dec.push(std::slice::from_ref(b)));
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, r#"{"a":1}"#);
        assert!(events[1].is_done());
    }

    #[test]
    fn test_decode_multibyte_split() {
        let raw = "data: héllo\n\n".as_bytes();
        let (a, b) = raw.split_at(8);
        let mut dec = SseDecoder::new();
        assert!(dec.push(a).is_empty());
        assert_eq!(dec.push(b)[0].data, "héllo");
    }

    #[test]
    fn test_finish_flushes_unterminated() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"data: tail").is_empty());
        assert_eq!(dec.finish().unwrap().data, "tail");
        assert!(dec.finish().is_none());
    }
}
