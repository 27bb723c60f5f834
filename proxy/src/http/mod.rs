//! HTTP/1.1 connection layer
//!
//! Request framing (Content-Length and chunked bodies, keep-alive,
//! pipelining), response writing (fixed-length or chunked), and SSE framing.

pub mod chunked;
pub mod connection;
pub mod request;
pub mod response;
pub mod sse;

pub use connection::{read_loop, ConnectionWriter, Inbound, WriteTag, INBOUND_QUEUE};
pub use request::{Headers, HttpRequest, RequestParser};
pub use response::{Response, ResponseHead};
pub use sse::{SseDecoder, SseEvent};

/// Head used for every streaming response
pub fn event_stream_head() -> ResponseHead {
    ResponseHead::new(200)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
}
