//! Framed duplex channel between the parent and one child.
//!
//! Each message is a 4-byte big-endian unsigned length followed by that many
//! bytes of serde_json payload. The encoding is private to the process
//! family; it only has to round-trip arbitrary values on the same machine.
//!
//! Frame I/O runs with supervised-signal delivery blocked so a signal-driven
//! pass can never observe a partial frame.

#![allow(dead_code)] // Some accessors are for monitoring and tests

use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use serde_json::Value;

use crate::error::{PreforkError, Result};
use crate::signals::SignalMask;

const READ_CHUNK_SIZE: usize = 4096;
const FRAME_HEADER_LEN: usize = 4;

/// One endpoint of a framed duplex channel.
pub(crate) struct Channel {
    stream: UnixStream,
    /// Bytes received but not yet assembled into a full frame.
    rx_buf: Vec<u8>,
    closed: bool,
    truncation_logged: bool,
}

impl Channel {
    /// Create a connected channel pair. After a fork, each process keeps one
    /// end and drops the other.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self::from_stream(a), Self::from_stream(b)))
    }

    fn from_stream(stream: UnixStream) -> Self {
        Self {
            stream,
            rx_buf: Vec::new(),
            closed: false,
            truncation_logged: false,
        }
    }

    /// Serialize `value` and write it as a single frame.
    pub fn send(&mut self, value: &Value) -> Result<()> {
        let payload = serde_json::to_vec(value).map_err(PreforkError::Encode)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| PreforkError::FrameTooLarge(payload.len()))?;

        let _mask = SignalMask::block()?;
        self.stream.write_all(&len.to_be_bytes())?;
        self.stream.write_all(&payload)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Receive one frame, blocking up to `timeout` (`None` blocks
    /// indefinitely).
    ///
    /// Returns `Ok(None)` once the peer has closed the stream at a frame
    /// boundary. A close in the middle of a frame is a transport error, as is
    /// an expired timeout.
    pub fn recv_timeout(&mut self, timeout: Option<Duration>) -> Result<Option<Value>> {
        if let Some(value) = self.take_frame()? {
            return Ok(Some(value));
        }
        if self.closed {
            return self.at_eof();
        }

        let _mask = SignalMask::block()?;
        self.stream.set_read_timeout(timeout)?;
        loop {
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.closed = true;
                    return self.at_eof();
                }
                Ok(n) => {
                    self.rx_buf.extend_from_slice(&chunk[..n]);
                    if let Some(value) = self.take_frame()? {
                        return Ok(Some(value));
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(PreforkError::Transport(e)),
            }
        }
    }

    /// Drain every complete frame currently available without blocking.
    ///
    /// Undecodable frames are dropped with a log event; EOF is latched and
    /// visible through [`Channel::is_closed`].
    pub fn poll(&mut self) -> Result<Vec<Value>> {
        if !self.closed {
            let _mask = SignalMask::block()?;
            self.stream.set_nonblocking(true)?;
            let outcome = self.slurp_available();
            let restore = self.stream.set_nonblocking(false);
            outcome?;
            restore?;
        }

        let mut frames = Vec::new();
        loop {
            match self.take_frame() {
                Ok(Some(value)) => frames.push(value),
                Ok(None) => break,
                Err(e) => {
                    // The malformed frame's bytes are already consumed.
                    tracing::error!(error = %e, "dropping undecodable frame");
                }
            }
        }

        if self.closed && !self.rx_buf.is_empty() && !self.truncation_logged {
            self.truncation_logged = true;
            tracing::error!(
                residue = self.rx_buf.len(),
                "channel closed mid-frame; discarding partial data"
            );
            self.rx_buf.clear();
        }
        Ok(frames)
    }

    /// Whether the peer has closed its end.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether undelivered bytes are still buffered locally.
    pub fn has_buffered(&self) -> bool {
        !self.rx_buf.is_empty()
    }

    /// Fully read out: EOF observed and nothing left in the buffer.
    pub fn drained(&self) -> bool {
        self.closed && self.rx_buf.is_empty()
    }

    fn slurp_available(&mut self) -> Result<()> {
        loop {
            let mut chunk = [0u8; READ_CHUNK_SIZE];
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.closed = true;
                    return Ok(());
                }
                Ok(n) => self.rx_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(PreforkError::Transport(e)),
            }
        }
    }

    /// Extract one complete frame from the buffer, if present. The frame's
    /// bytes are consumed even when decoding fails, so a bad frame cannot
    /// wedge the stream.
    fn take_frame(&mut self) -> Result<Option<Value>> {
        if self.rx_buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&self.rx_buf[..FRAME_HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if self.rx_buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        let frame: Vec<u8> = self.rx_buf.drain(..FRAME_HEADER_LEN + len).collect();
        serde_json::from_slice(&frame[FRAME_HEADER_LEN..])
            .map(Some)
            .map_err(PreforkError::Decode)
    }

    fn at_eof(&mut self) -> Result<Option<Value>> {
        if self.rx_buf.is_empty() {
            Ok(None)
        } else {
            self.rx_buf.clear();
            Err(PreforkError::Transport(std::io::Error::new(
                ErrorKind::UnexpectedEof,
                "stream closed mid-frame",
            )))
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("closed", &self.closed)
            .field("buffered", &self.rx_buf.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_send_recv_roundtrip() {
        let (mut tx, mut rx) = Channel::pair().unwrap();

        tx.send(&json!({"task": "resize", "width": 640})).unwrap();
        tx.send(&json!([1, 2, 3])).unwrap();
        drop(tx);

        assert_eq!(
            rx.recv_timeout(Some(Duration::from_secs(1))).unwrap(),
            Some(json!({"task": "resize", "width": 640}))
        );
        assert_eq!(
            rx.recv_timeout(Some(Duration::from_secs(1))).unwrap(),
            Some(json!([1, 2, 3]))
        );
        // Orderly close at a frame boundary.
        assert_eq!(rx.recv_timeout(Some(Duration::from_secs(1))).unwrap(), None);
        assert!(rx.is_closed());
    }

    #[test]
    fn test_poll_preserves_frame_boundaries() {
        let (mut tx, mut rx) = Channel::pair().unwrap();

        for i in 0..5 {
            tx.send(&json!({"seq": i})).unwrap();
        }
        drop(tx);

        // Everything was written before the first poll, so all five frames
        // must come back distinct and in order.
        let frames = rx.poll().unwrap();
        assert_eq!(frames.len(), 5);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame, &json!({"seq": i}));
        }
        let _ = rx.poll().unwrap();
        assert!(rx.drained());
    }

    #[test]
    fn test_poll_without_data_does_not_block() {
        let (_tx, mut rx) = Channel::pair().unwrap();
        let frames = rx.poll().unwrap();
        assert!(frames.is_empty());
        assert!(!rx.is_closed());
    }

    #[test]
    fn test_truncated_frame_is_transport_error() {
        let (tx, mut rx) = Channel::pair().unwrap();

        // A header promising 100 bytes, then close the stream.
        let mut raw = tx.stream;
        raw.write_all(&100u32.to_be_bytes()).unwrap();
        raw.write_all(b"short").unwrap();
        drop(raw);

        let err = rx.recv_timeout(Some(Duration::from_secs(1))).unwrap_err();
        assert!(matches!(err, PreforkError::Transport(_)));
    }

    #[test]
    fn test_undecodable_frame_is_dropped_not_fatal() {
        let (tx, mut rx) = Channel::pair().unwrap();

        let mut raw = tx.stream;
        let garbage = b"not json at all";
        raw.write_all(&(garbage.len() as u32).to_be_bytes()).unwrap();
        raw.write_all(garbage).unwrap();

        // A well-formed frame after the bad one must still arrive.
        let mut good = Channel::from_stream(raw);
        good.send(&json!("survivor")).unwrap();
        drop(good);

        let frames = rx.poll().unwrap();
        assert_eq!(frames, vec![json!("survivor")]);
    }
}
