//! Per-connection read and write tasks
//!
//! Reads run as a continuous loop that parses requests and hands them over a
//! bounded channel. Writes go through a single writer task: every write waits
//! for the previous one to complete, so response heads, chunks and SSE
//! frames can never interleave on the socket.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::chunked::{encode_chunk, TERMINAL_CHUNK};
use super::request::{HttpRequest, RequestParser};
use super::response::{Response, ResponseHead};
use super::sse::SseEvent;
use crate::error::HttpError;

/// Queue depth between the reader and the request handler
pub const INBOUND_QUEUE: usize = 8;

/// Queue depth in front of the writer task
const WRITE_QUEUE: usize = 32;

const READ_BUF: usize = 16 * 1024;

/// What a write carries; used for ordering diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTag {
    Response,
    Head,
    Chunk,
    Terminal,
}

struct WriteOp {
    bytes: Vec<u8>,
    tag: WriteTag,
    done: oneshot::Sender<io::Result<()>>,
}

/// Handle for writing to one connection. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionWriter {
    tx: mpsc::Sender<WriteOp>,
    cancel: CancellationToken,
}

impl ConnectionWriter {
    /// Start the writer task over the socket's write half.
    ///
    /// A write error cancels `cancel`, which tears down the connection.
    pub fn spawn<W>(mut sink: W, cancel: CancellationToken) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<WriteOp>(WRITE_QUEUE);
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut seq: u64 = 0;
            while let Some(op) = rx.recv().await {
                seq += 1;
                let result = async {
                    sink.write_all(&op.bytes).await?;
                    sink.flush().await
                }
                .await;

                if let Err(e) = &result {
                    tracing::debug!(seq, tag = ?op.tag, "write failed: {}", e);
                    task_cancel.cancel();
                }
                let failed = result.is_err();
                let _ = op.done.send(result);
                if failed {
                    break;
                }
            }
            let _ = sink.shutdown().await;
        });

        (Self { tx, cancel }, handle)
    }

    /// Write bytes and wait until they have been flushed to the socket.
    pub async fn write(&self, bytes: Vec<u8>, tag: WriteTag) -> Result<(), HttpError> {
        if self.cancel.is_cancelled() {
            return Err(HttpError::Closed);
        }
        let (done, wait) = oneshot::channel();
        self.tx
            .send(WriteOp { bytes, tag, done })
            .await
            .map_err(|_| HttpError::Closed)?;
        match wait.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(HttpError::Io(e)),
            Err(_) => Err(HttpError::Closed),
        }
    }

    pub async fn send_response(&self, response: &Response) -> Result<(), HttpError> {
        self.write(response.encode(), WriteTag::Response).await
    }

    /// Begin a chunked response
    pub async fn start_chunked(&self, head: &ResponseHead) -> Result<(), HttpError> {
        self.write(head.encode_chunked(), WriteTag::Head).await
    }

    pub async fn write_chunk(&self, payload: &[u8]) -> Result<(), HttpError> {
        let framed = encode_chunk(payload);
        if framed.is_empty() {
            return Ok(());
        }
        self.write(framed, WriteTag::Chunk).await
    }

    pub async fn write_event(&self, event: &SseEvent) -> Result<(), HttpError> {
        self.write_chunk(&event.encode()).await
    }

    /// Terminate a chunked response with the zero-length chunk
    pub async fn finish_chunked(&self) -> Result<(), HttpError> {
        self.write(TERMINAL_CHUNK.to_vec(), WriteTag::Terminal).await
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Items handed from the reader to the request handler
#[derive(Debug)]
pub enum Inbound {
    Request(HttpRequest),
    /// The byte stream could not be framed; the connection must close
    Malformed(HttpError),
}

/// Read the socket until EOF, error or cancellation, forwarding each parsed
/// request. EOF and socket errors cancel the connection.
pub async fn read_loop<R>(mut source: R, tx: mpsc::Sender<Inbound>, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut parser = RequestParser::new();
    let mut buf = vec![0u8; READ_BUF];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return,
            read = source.read(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!("peer closed connection");
                    cancel.cancel();
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("read error: {}", e);
                    cancel.cancel();
                    return;
                }
            }
        };

        parser.push(&buf[..n]);
        loop {
            match parser.next_request() {
                Ok(Some(request)) => {
                    if tx.send(Inbound::Request(request)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Inbound::Malformed(e)).await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writes_are_ordered_and_framed() {
        let (client, server) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        let (writer, handle) = ConnectionWriter::spawn(server, cancel.clone());

        writer
            .start_chunked(&ResponseHead::new(200).header("Content-Type", "text/event-stream"))
            .await
            .unwrap();
        writer.write_event(&SseEvent::data("one")).await.unwrap();
        writer.write_event(&SseEvent::done()).await.unwrap();
        writer.finish_chunked().await.unwrap();
        drop(writer);
        handle.await.unwrap();

        let mut received = Vec::new();
        let mut client = client;
        client.read_to_end(&mut received).await.unwrap();
        let text = String::from_utf8(received).unwrap();
        let body = text.split("\r\n\r\n").skip(1).collect::<Vec<_>>().join("\r\n\r\n");
        assert_eq!(body, "b\r\ndata: one\n\n\r\ne\r\ndata: [DONE]\n\n\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn test_write_after_cancel_fails() {
        let (_client, server) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let (writer, _handle) = ConnectionWriter::spawn(server, cancel.clone());
        cancel.cancel();
        assert!(matches!(
            writer.write(b"x".to_vec(), WriteTag::Chunk).await,
            Err(HttpError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_read_loop_forwards_requests_and_cancels_on_eof() {
        let (mut client, server) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(INBOUND_QUEUE);
        let task = tokio::spawn(read_loop(server, tx, cancel.clone()));

        client
            .write_all(b"GET /v1/models HTTP/1.1\r\n\r\nPOST /mcp HTTP/1.1\r\nContent-Length: 2\r\n\r\n{}")
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, Inbound::Request(ref r) if r.path == "/v1/models"));
        assert!(matches!(second, Inbound::Request(ref r) if r.body == b"{}"));

        drop(client);
        task.await.unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_read_loop_reports_malformed() {
        let (mut client, server) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(INBOUND_QUEUE);
        tokio::spawn(read_loop(server, tx, cancel));

        client.write_all(b"BROKEN\r\n\r\n").await.unwrap();
        assert!(matches!(rx.recv().await, Some(Inbound::Malformed(_))));
    }
}
