//! Server-sent-event relay.
//!
//! Upstream bytes are read one line at a time and sent to the client as they
//! arrive. A blank line closes an event, which is logged and renews the call's
//! deadline, so a stream lives as long as events keep arriving and dies once
//! they stop for longer than the extension window.

use crate::call_context::CallContext;
use crate::error::ProxyError;
use crate::log_entry::{LogEntry, Logger, RequestInfo};
use crate::monitoring::Metrics;
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, SizeHint};
use log::trace;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;

/// Frames buffered between the relay task and the client connection.
pub const CLIENT_CHANNEL_CAPACITY: usize = 16;

/// Creates the writer half used by the relay and the response body handed to
/// the server.
pub fn client_channel(capacity: usize) -> (ClientWriter, ChannelBody) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        ClientWriter {
            tx,
            pending: BytesMut::new(),
        },
        ChannelBody { rx },
    )
}

/// Write side of a streamed client response. Writes are buffered until
/// [`ClientWriter::flush`].
#[derive(Debug)]
pub struct ClientWriter {
    tx: mpsc::Sender<Bytes>,
    pending: BytesMut,
}

impl ClientWriter {
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.pending.extend_from_slice(data);
        data.len()
    }

    /// Sends everything written so far. Fails once the client has gone away.
    pub async fn flush(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let chunk = self.pending.split().freeze();
        self.tx
            .send(chunk)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"))
    }
}

/// Response body fed by a [`ClientWriter`]. Ends when the writer is dropped.
#[derive(Debug)]
pub struct ChannelBody {
    rx: mpsc::Receiver<Bytes>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|data| Ok(Frame::data(data))))
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::default()
    }
}

/// Adapts an HTTP body into a line-readable byte stream.
pub fn body_reader<B>(body: B) -> impl AsyncBufRead + Unpin + Send
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    StreamReader::new(body.into_data_stream().map_err(io::Error::other))
}

/// True for the empty line that terminates an SSE event.
pub fn is_event_terminator(line: &[u8]) -> bool {
    line == b"\n" || line == b"\r\n"
}

fn has_content(event: &[u8]) -> bool {
    event.iter().any(|b| !b.is_ascii_whitespace())
}

/// One event-stream relay run for a single call.
pub struct EventStreamRelay<'a> {
    pub call: &'a CallContext,
    pub info: &'a RequestInfo,
    pub status: u16,
    pub logger: &'a dyn Logger,
    pub metrics: &'a Metrics,
    pub extension: Duration,
}

impl EventStreamRelay<'_> {
    /// Copies `upstream` to `writer` until the upstream ends, the call is
    /// cancelled or an I/O error occurs. Every line is sent to the client as
    /// soon as it is read. Returns the number of bytes the client was sent.
    pub async fn relay<R>(&self, writer: &mut ClientWriter, mut upstream: R) -> Result<u64, ProxyError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut written = 0u64;
        let mut line = Vec::with_capacity(512);
        let mut event = BytesMut::new();

        loop {
            line.clear();
            let read = tokio::select! {
                biased;
                _ = self.call.cancelled() => None,
                read = upstream.read_until(b'\n', &mut line) => Some(read),
            };

            let read = match read {
                Some(Ok(read)) => read,
                Some(Err(err)) => return Err(self.abandon(writer, &line, err.into()).await),
                None => return Err(self.abandon(writer, &line, ProxyError::Cancelled).await),
            };
            if read == 0 {
                trace!("[call {}] event stream ended by upstream", self.call.index());
                return Ok(written);
            }

            writer.write(&line);
            writer.flush().await?;
            written += line.len() as u64;

            if !is_event_terminator(&line) {
                event.extend_from_slice(&line);
                continue;
            }

            if has_content(&event) {
                let frame = event.split().freeze();
                self.logger.log(&LogEntry::stream_frame(
                    self.call.index(),
                    self.info,
                    self.status,
                    self.call.elapsed(),
                    frame,
                ));
                self.metrics.record_stream_frame();
            } else {
                event.clear();
            }

            if self.call.is_cancelled() {
                return Ok(written);
            }
            self.call.extend(self.extension);
        }
    }

    /// Hands the client whatever part of a line was read before the relay
    /// stopped, then returns `err`.
    async fn abandon(&self, writer: &mut ClientWriter, partial: &[u8], err: ProxyError) -> ProxyError {
        writer.write(partial);
        if let Err(flush_err) = writer.flush().await {
            trace!("[call {}] partial line not delivered: {}", self.call.index(), flush_err);
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_terminator() {
        assert!(is_event_terminator(b"\n"));
        assert!(is_event_terminator(b"\r\n"));
        assert!(!is_event_terminator(b"data: x\n"));
        assert!(!is_event_terminator(b""));
        assert!(!is_event_terminator(b" \n"));
    }

    #[test]
    fn test_has_content() {
        assert!(!has_content(b""));
        assert!(!has_content(b"\r\n"));
        assert!(has_content(b"data: {}\n"));
    }

    #[tokio::test]
    async fn test_writer_buffers_until_flush() {
        let (mut writer, body) = client_channel(4);
        writer.write(b"event: head\n");
        writer.write(b"data: 1\n\n");
        writer.flush().await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected.as_ref(), b"event: head\ndata: 1\n\n");
    }

    #[tokio::test]
    async fn test_flush_fails_after_client_drop() {
        let (mut writer, body) = client_channel(1);
        drop(body);
        writer.write(b"data: x\n\n");
        let err = writer.flush().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
