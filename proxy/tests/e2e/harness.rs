//! Shared helpers: proxy startup, fake upstream and a raw HTTP client

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use editor_proxy::config::{ConfigHandle, ProxyConfig};
use editor_proxy::error::ToolError;
use editor_proxy::http::chunked::decode_chunked;
use editor_proxy::mcp::ToolInvoker;
use editor_proxy::server::{self, ServerContext};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Invoker that answers every call with a fixed string
pub struct CannedInvoker(pub &'static str);

#[async_trait]
impl ToolInvoker for CannedInvoker {
    async fn invoke(
        &self,
        _server: &str,
        _tool: &str,
        _arguments: Value,
        _cancel: &CancellationToken,
    ) -> Result<String, ToolError> {
        Ok(self.0.to_string())
    }
}

/// Invoker whose every call fails with a tool error
pub struct FailingInvoker(pub &'static str);

#[async_trait]
impl ToolInvoker for FailingInvoker {
    async fn invoke(
        &self,
        _server: &str,
        tool: &str,
        _arguments: Value,
        _cancel: &CancellationToken,
    ) -> Result<String, ToolError> {
        Err(ToolError::Failed {
            tool: tool.to_string(),
            message: self.0.to_string(),
        })
    }
}

pub struct Proxy {
    pub ctx: Arc<ServerContext>,
    pub addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn start_proxy(toml: &str) -> Proxy {
    start_proxy_with(toml, Arc::new(CannedInvoker("ok"))).await
}

pub async fn start_proxy_with(toml: &str, invoker: Arc<dyn ToolInvoker>) -> Proxy {
    let config = ProxyConfig::from_toml(toml).expect("test config parses");
    let ctx = ServerContext::new(ConfigHandle::new(config), invoker);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let shutdown = CancellationToken::new();
    tokio::spawn(server::run(ctx.clone(), listener, shutdown.clone()));
    Proxy {
        ctx,
        addr,
        shutdown,
    }
}

/// Config with one provider serving `qwen3` from `upstream`
pub fn config_for(upstream: SocketAddr) -> String {
    format!(
        r#"
[bridge]
sse_close_grace_ms = 20

[[providers]]
name = "fake"
base_url = "http://{}/v1"
models = ["qwen3"]
"#,
        upstream
    )
}

/// Build an upstream event stream from chunk payloads
pub fn sse(chunks: &[Value]) -> String {
    let mut out = String::new();
    for chunk in chunks {
        out.push_str(&format!("data: {}\n\n", chunk));
    }
    out.push_str("data: [DONE]\n\n");
    out
}

/// Fake provider. Serves `replies` in order, one per connection, and reports
/// each request body it received.
pub async fn fake_upstream(replies: Vec<String>) -> (SocketAddr, mpsc::UnboundedReceiver<Value>) {
    let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n";
    fake_upstream_raw(replies.into_iter().map(|r| format!("{}{}", head, r)).collect()).await
}

/// Provider that answers once with `status` and a JSON error body
pub async fn failing_upstream(status: u16, message: &str) -> (SocketAddr, mpsc::UnboundedReceiver<Value>) {
    let body = serde_json::json!({"error": {"message": message}}).to_string();
    let reply = format!(
        "HTTP/1.1 {} Error\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    fake_upstream_raw(vec![reply]).await
}

/// Like [`fake_upstream`], but each reply is a complete raw HTTP response
pub async fn fake_upstream_raw(replies: Vec<String>) -> (SocketAddr, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        for reply in replies {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let body = read_request_body(&mut stream).await;
            let _ = tx.send(serde_json::from_slice(&body).unwrap_or(Value::Null));
            let _ = stream.write_all(reply.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
    });

    (addr, rx)
}

async fn read_request_body(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = find(&buf, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let len = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + len {
                return buf[end + 4..end + 4 + len].to_vec();
            }
        }
        let n = stream.read(&mut chunk).await.unwrap_or(0);
        if n == 0 {
            return Vec::new();
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// A response read off the wire
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("response body is JSON")
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// `data:` payloads of an event-stream body
    pub fn events(&self) -> Vec<String> {
        self.text()
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .map(str::to_string)
            .collect()
    }
}

/// Raw client connection. Keeps unread bytes between responses.
pub struct Client {
    pub stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect to proxy");
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    pub async fn send(&mut self, method: &str, path: &str, headers: &[(&str, &str)], body: &str) {
        let mut request = format!("{} {} HTTP/1.1\r\nHost: localhost\r\n", method, path);
        for (name, value) in headers {
            request.push_str(&format!("{}: {}\r\n", name, value));
        }
        if !body.is_empty() || method == "POST" {
            request.push_str("Content-Type: application/json\r\n");
            request.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        request.push_str("\r\n");
        request.push_str(body);
        self.stream
            .write_all(request.as_bytes())
            .await
            .expect("write request");
    }

    pub async fn post_json(&mut self, path: &str, headers: &[(&str, &str)], body: &Value) -> RawResponse {
        self.send("POST", path, headers, &body.to_string()).await;
        self.response().await
    }

    /// Read exactly one response; panics on EOF or timeout
    pub async fn response(&mut self) -> RawResponse {
        tokio::time::timeout(IO_TIMEOUT, async {
            loop {
                if let Some(response) = self.try_parse() {
                    return response;
                }
                self.fill().await;
            }
        })
        .await
        .expect("response within timeout")
    }

    /// Read only the head of a streaming response
    pub async fn head(&mut self) -> RawResponse {
        tokio::time::timeout(IO_TIMEOUT, async {
            loop {
                if let Some(end) = find(&self.buf, b"\r\n\r\n") {
                    let (status, headers) = parse_head(&self.buf[..end]);
                    self.buf.drain(..end + 4);
                    return RawResponse {
                        status,
                        headers,
                        body: Vec::new(),
                    };
                }
                self.fill().await;
            }
        })
        .await
        .expect("head within timeout")
    }

    /// Read the rest of a chunked body whose head was already consumed
    pub async fn chunked_body(&mut self) -> Vec<u8> {
        tokio::time::timeout(IO_TIMEOUT, async {
            loop {
                if let Some((body, used)) = decode_chunked(&self.buf).expect("valid chunked body") {
                    self.buf.drain(..used);
                    return body;
                }
                self.fill().await;
            }
        })
        .await
        .expect("chunked body within timeout")
    }

    /// Whether the peer closes the connection within the timeout
    pub async fn closed(&mut self) -> bool {
        let mut chunk = [0u8; 1024];
        matches!(
            tokio::time::timeout(IO_TIMEOUT, self.stream.read(&mut chunk)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }

    async fn fill(&mut self) {
        let mut chunk = [0u8; 4096];
        let n = self.stream.read(&mut chunk).await.expect("read response");
        assert!(n > 0, "connection closed mid-response");
        self.buf.extend_from_slice(&chunk[..n]);
    }

    fn try_parse(&mut self) -> Option<RawResponse> {
        let end = find(&self.buf, b"\r\n\r\n")?;
        let (status, headers) = parse_head(&self.buf[..end]);
        let body_start = end + 4;
        let lookup = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
        };

        let (body, used) = if lookup("Transfer-Encoding").is_some_and(|v| v.eq_ignore_ascii_case("chunked")) {
            let (body, used) = decode_chunked(&self.buf[body_start..]).expect("valid chunked body")?;
            (body, body_start + used)
        } else {
            let len = lookup("Content-Length")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0);
            if self.buf.len() < body_start + len {
                return None;
            }
            (self.buf[body_start..body_start + len].to_vec(), body_start + len)
        };

        self.buf.drain(..used);
        Some(RawResponse {
            status,
            headers,
            body,
        })
    }
}

fn parse_head(head: &[u8]) -> (u16, Vec<(String, String)>) {
    let text = String::from_utf8_lossy(head);
    let mut lines = text.split("\r\n");
    let status = lines
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|s| s.parse().ok())
        .expect("status line");
    let headers = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    (status, headers)
}
