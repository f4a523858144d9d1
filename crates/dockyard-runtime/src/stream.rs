//! Log and event streams returned by a runtime.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use tokio::sync::mpsc;

use crate::demux::Demuxer;
use crate::error::{RuntimeError, RuntimeResult};
use crate::wire::RuntimeEvent;

/// Raw (still multiplexed) container log output.
pub enum LogStream {
    /// Streaming HTTP response body.
    Body(Incoming),
    /// Output already in memory.
    Buffered(VecDeque<Bytes>),
    /// Output produced by a live in-process source; ends when the sender
    /// is dropped.
    Channel(mpsc::Receiver<Bytes>),
}

impl LogStream {
    pub fn buffered(chunks: impl IntoIterator<Item = Bytes>) -> Self {
        LogStream::Buffered(chunks.into_iter().collect())
    }

    /// Next raw chunk, or `None` at end of stream.
    pub async fn next_chunk(&mut self) -> Option<RuntimeResult<Bytes>> {
        match self {
            LogStream::Body(body) => loop {
                match body.frame().await? {
                    Ok(frame) => {
                        if let Ok(data) = frame.into_data() {
                            return Some(Ok(data));
                        }
                    }
                    Err(e) => return Some(Err(RuntimeError::Transport(e))),
                }
            },
            LogStream::Buffered(chunks) => chunks.pop_front().map(Ok),
            LogStream::Channel(rx) => rx.recv().await.map(Ok),
        }
    }

    /// Consume and discard the stream; returns once it ends.
    pub async fn drain(mut self) -> RuntimeResult<u64> {
        let mut total = 0u64;
        while let Some(chunk) = self.next_chunk().await {
            total += chunk?.len() as u64;
        }
        Ok(total)
    }

    /// Demultiplex the stream into combined stdout+stderr, keeping at most
    /// `limit` bytes. Reading stops once the limit is reached.
    pub async fn read_demuxed(mut self, limit: usize) -> RuntimeResult<Bytes> {
        let mut demuxer = Demuxer::new();
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await {
            for frame in demuxer.push(&chunk?)? {
                let room = limit - out.len();
                if frame.data.len() >= room {
                    out.extend_from_slice(&frame.data[..room]);
                    return Ok(out.freeze());
                }
                out.extend_from_slice(&frame.data);
            }
        }
        demuxer.finish()?;
        Ok(out.freeze())
    }
}

impl std::fmt::Debug for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            LogStream::Body(_) => "body",
            LogStream::Buffered(_) => "buffered",
            LogStream::Channel(_) => "channel",
        };
        f.debug_tuple("LogStream").field(&kind).finish()
    }
}

/// Container lifecycle events from one runtime.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<RuntimeResult<RuntimeEvent>>,
}

impl EventStream {
    pub fn new(rx: mpsc::Receiver<RuntimeResult<RuntimeEvent>>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<RuntimeResult<RuntimeEvent>> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::{StreamKind, encode_frame};

    fn make_log(parts: &[(&str, StreamKind)]) -> LogStream {
        LogStream::buffered(parts.iter().map(|(s, k)| encode_frame(*k, s.as_bytes())))
    }

    #[tokio::test]
    async fn read_demuxed_combines_streams() {
        let log = make_log(&[("out\n", StreamKind::Stdout), ("err\n", StreamKind::Stderr)]);
        let out = log.read_demuxed(1024).await.unwrap();
        assert_eq!(&out[..], b"out\nerr\n");
    }

    #[tokio::test]
    async fn read_demuxed_truncates_at_limit() {
        let log = make_log(&[("0123456789", StreamKind::Stdout), ("abc", StreamKind::Stdout)]);
        let out = log.read_demuxed(4).await.unwrap();
        assert_eq!(&out[..], b"0123");
    }

    #[tokio::test]
    async fn channel_stream_ends_when_sender_drops() {
        let (tx, rx) = mpsc::channel(4);
        let log = LogStream::Channel(rx);
        tx.send(Bytes::from_static(b"abc")).await.unwrap();
        drop(tx);
        assert_eq!(log.drain().await.unwrap(), 3);
    }
}
