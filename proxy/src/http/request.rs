//! HTTP/1.1 request framing
//!
//! [`RequestParser`] accumulates socket bytes and yields complete requests.
//! After each request the parse state resets while any bytes already
//! buffered for the next (pipelined) request are kept.

use memchr::memmem;

use super::chunked::decode_chunked_within;
use crate::error::HttpError;

/// Upper bound on the request line plus headers
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Upper bound on a request body, either framing
pub const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Chunk size lines and trailers a chunked body may carry on top of its data
const CHUNK_FRAMING_SLACK: usize = 64 * 1024;

/// Case-insensitive header list, in arrival order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get(name)
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A fully received request
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Whether the client expects the connection to stay open afterwards
    pub fn keep_alive(&self) -> bool {
        if self.headers.contains_token("connection", "close") {
            return false;
        }
        if self.version == "HTTP/1.0" {
            return self.headers.contains_token("connection", "keep-alive");
        }
        true
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }
}

#[derive(Debug)]
struct RequestHead {
    method: String,
    path: String,
    query: Option<String>,
    version: String,
    headers: Headers,
}

#[derive(Debug)]
enum ParseState {
    Head,
    Body { head: RequestHead, length: usize },
    Chunked { head: RequestHead },
}

/// Incremental request parser for one connection
#[derive(Debug)]
pub struct RequestParser {
    buf: Vec<u8>,
    state: ParseState,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            state: ParseState::Head,
        }
    }

    /// Append bytes read from the socket
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes held for a request that is not yet complete
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete request, if one is buffered.
    pub fn next_request(&mut self) -> Result<Option<HttpRequest>, HttpError> {
        loop {
            match std::mem::replace(&mut self.state, ParseState::Head) {
                ParseState::Head => {
                    let Some(end) = memmem::find(&self.buf, b"\r\n\r\n") else {
                        if self.buf.len() > MAX_HEAD_BYTES {
                            return Err(HttpError::HeadTooLarge(MAX_HEAD_BYTES));
                        }
                        return Ok(None);
                    };
                    let head = parse_head(&self.buf[..end])?;
                    self.buf.drain(..end + 4);

                    self.state = if head.headers.contains_token("transfer-encoding", "chunked") {
                        ParseState::Chunked { head }
                    } else {
                        let length = match head.headers.get("content-length") {
                            Some(v) => v
                                .trim()
                                .parse::<usize>()
                                .map_err(|_| HttpError::BadContentLength(v.to_string()))?,
                            None => 0,
                        };
                        if length > MAX_BODY_BYTES {
                            return Err(HttpError::BodyTooLarge(MAX_BODY_BYTES));
                        }
                        ParseState::Body { head, length }
                    };
                }
                ParseState::Body { head, length } => {
                    if self.buf.len() < length {
                        self.state = ParseState::Body { head, length };
                        return Ok(None);
                    }
                    let body: Vec<u8> = self.buf.drain(..length).collect();
                    return Ok(Some(finish(head, body)));
                }
                ParseState::Chunked { head } => match decode_chunked_within(&self.buf, MAX_BODY_BYTES)? {
                    Some((body, used)) => {
                        self.buf.drain(..used);
                        return Ok(Some(finish(head, body)));
                    }
                    None => {
                        if self.buf.len() > MAX_BODY_BYTES + CHUNK_FRAMING_SLACK {
                            return Err(HttpError::BodyTooLarge(MAX_BODY_BYTES));
                        }
                        self.state = ParseState::Chunked { head };
                        return Ok(None);
                    }
                },
            }
        }
    }
}

fn finish(head: RequestHead, body: Vec<u8>) -> HttpRequest {
    HttpRequest {
        method: head.method,
        path: head.path,
        query: head.query,
        version: head.version,
        headers: head.headers,
        body,
    }
}

fn parse_head(raw: &[u8]) -> Result<RequestHead, HttpError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| HttpError::BadRequestLine("non-utf8 request head".to_string()))?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(HttpError::BadRequestLine(request_line.to_string()));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(HttpError::BadRequestLine(request_line.to_string()));
    }

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q.to_string())),
        None => (target.to_string(), None),
    };

    let mut headers = Headers::default();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(HttpError::BadHeader(line.to_string()));
        };
        headers.push(name.trim(), value.trim());
    }

    Ok(RequestHead {
        method: method.to_ascii_uppercase(),
        path,
        query,
        version: version.to_string(),
        headers,
    })
}
