//! Response heads and fixed-length bodies

use serde_json::Value;

/// Status line plus headers for an outgoing response
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Head for a body of known length
    pub fn encode_fixed(&self, body_len: usize) -> Vec<u8> {
        let mut head = self.status_and_headers();
        head.push_str(&format!("Content-Length: {}\r\n\r\n", body_len));
        head.into_bytes()
    }

    /// Head for a `Transfer-Encoding: chunked` body
    pub fn encode_chunked(&self) -> Vec<u8> {
        let mut head = self.status_and_headers();
        head.push_str("Transfer-Encoding: chunked\r\n\r\n");
        head.into_bytes()
    }

    fn status_and_headers(&self) -> String {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status));
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out
    }
}

/// A complete fixed-length response
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub head: ResponseHead,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(head: ResponseHead, body: Vec<u8>) -> Self {
        Self { head, body }
    }

    pub fn json(status: u16, value: &Value) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_default();
        Self::new(
            ResponseHead::new(status).header("Content-Type", "application/json"),
            body,
        )
    }

    pub fn empty(status: u16) -> Self {
        Self::new(ResponseHead::new(status), Vec::new())
    }

    /// OpenAI-style error body
    pub fn error(status: u16, kind: &str, message: &str) -> Self {
        Self::json(
            status,
            &serde_json::json!({
                "error": { "type": kind, "message": message }
            }),
        )
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.head = self.head.header(name, value);
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.head.encode_fixed(self.body.len());
        out.extend_from_slice(&self.body);
        out
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        411 => "Length Required",
        413 => "Payload Too Large",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_encoding() {
        let resp = Response::json(200, &serde_json::json!({"ok": true}));
        let text = String::from_utf8(resp.encode()).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Content-Length: 11\r\n\r\n{\"ok\":true}"));
    }

    #[test]
    fn test_accepted_empty() {
        let text = String::from_utf8(Response::empty(202).encode()).unwrap();
        assert_eq!(text, "HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\n\r\n");
    }

    #[test]
    fn test_chunked_head() {
        let head = ResponseHead::new(200).header("Content-Type", "text/event-stream");
        let text = String::from_utf8(head.encode_chunked()).unwrap();
        assert!(text.ends_with("Transfer-Encoding: chunked\r\n\r\n"));
        assert!(!text.contains("Content-Length"));
    }
}
