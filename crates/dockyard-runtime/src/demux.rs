//! Multiplexed log stream framing.
//!
//! A non-TTY container's logs arrive as a sequence of frames:
//!
//! ```text
//! ┌────────┬──────────┬──────────────────┬───────────────┐
//! │ stream │ 0  0  0  │ length (u32, BE) │ payload ...   │
//! └────────┴──────────┴──────────────────┴───────────────┘
//!   byte 0   bytes 1-3     bytes 4-7        length bytes
//! ```
//!
//! Stream 0 (stdin) and 1 are stdout; 2 is stderr.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{RuntimeError, RuntimeResult};

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn from_selector(b: u8) -> RuntimeResult<Self> {
        match b {
            0 | 1 => Ok(StreamKind::Stdout),
            2 => Ok(StreamKind::Stderr),
            other => Err(RuntimeError::Demux(format!("unknown stream selector {other}"))),
        }
    }

    fn selector(self) -> u8 {
        match self {
            StreamKind::Stdout => 1,
            StreamKind::Stderr => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: StreamKind,
    pub data: Bytes,
}

/// Encode one frame.
pub fn encode_frame(kind: StreamKind, data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + data.len());
    buf.put_u8(kind.selector());
    buf.put_bytes(0, 3);
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    buf.freeze()
}

/// Incremental decoder: feed arbitrary chunks, get whole frames back.
#[derive(Debug, Default)]
pub struct Demuxer {
    buf: BytesMut,
}

impl Demuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `chunk` and return every frame now complete.
    pub fn push(&mut self, chunk: &[u8]) -> RuntimeResult<Vec<Frame>> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while self.buf.len() >= HEADER_LEN {
            let kind = StreamKind::from_selector(self.buf[0])?;
            let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
            if self.buf.len() < HEADER_LEN + len {
                break;
            }
            self.buf.advance(HEADER_LEN);
            let data = self.buf.split_to(len).freeze();
            frames.push(Frame { kind, data });
        }
        Ok(frames)
    }

    /// Fail if the stream ended inside a frame.
    pub fn finish(self) -> RuntimeResult<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::Demux(format!(
                "stream ended with {} bytes of partial frame",
                self.buf.len()
            )))
        }
    }
}

/// Decode a complete buffer.
pub fn demux(data: &[u8]) -> RuntimeResult<Vec<Frame>> {
    let mut d = Demuxer::new();
    let frames = d.push(data)?;
    d.finish()?;
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_interleaved_streams() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&encode_frame(StreamKind::Stdout, b"hello\n"));
        raw.extend_from_slice(&encode_frame(StreamKind::Stderr, b"oops\n"));

        let frames = demux(&raw).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].kind, StreamKind::Stdout);
        assert_eq!(&frames[0].data[..], b"hello\n");
        assert_eq!(frames[1].kind, StreamKind::Stderr);
    }

    #[test]
    fn header_layout_is_big_endian() {
        let f = encode_frame(StreamKind::Stderr, &[0u8; 258]);
        assert_eq!(&f[..8], &[2, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn stdin_selector_counts_as_stdout() {
        let raw = [0u8, 0, 0, 0, 0, 0, 0, 2, b'o', b'k'];
        let frames = demux(&raw).unwrap();
        assert_eq!(frames[0].kind, StreamKind::Stdout);
        assert_eq!(&frames[0].data[..], b"ok");
    }

    #[test]
    fn frames_split_across_chunks() {
        let raw = encode_frame(StreamKind::Stdout, b"split payload");
        let mut d = Demuxer::new();
        assert!(d.push(&raw[..5]).unwrap().is_empty());
        assert!(d.push(&raw[5..10]).unwrap().is_empty());
        let frames = d.push(&raw[10..]).unwrap();
        assert_eq!(&frames[0].data[..], b"split payload");
        d.finish().unwrap();
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let raw = encode_frame(StreamKind::Stdout, b"abcdef");
        assert!(demux(&raw[..10]).is_err());
    }

    #[test]
    fn unknown_selector_is_an_error() {
        let raw = [7u8, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(demux(&raw), Err(RuntimeError::Demux(_))));
    }
}
