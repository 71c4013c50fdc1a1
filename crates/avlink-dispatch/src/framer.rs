//! Outbound framing and inbound message extraction.
//!
//! Outbound payloads are wrapped in a fixed prefix/suffix pair ([`Framing`]).
//! Inbound stream bytes accumulate in a [`Framer`], which hands back one
//! delimiter-bounded message at a time.
//!
//! The default inbound delimiter is any unescaped line ending: `\r`, `\n`,
//! or `\r\n` taken as one unit. A line ending preceded by an odd number of
//! backslashes is part of the message. Empty messages are skipped.

use bytes::{Bytes, BytesMut};
use tracing::{trace, warn};

/// Default receive buffer cap before the buffer is reset.
pub const DEFAULT_MAX_FRAME_LEN: usize = 8192;

/// Prefix/suffix wrapped around every outbound stream payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framing {
    pub prefix: Bytes,
    pub suffix: Bytes,
}

impl Default for Framing {
    fn default() -> Self {
        Framing {
            prefix: Bytes::new(),
            suffix: Bytes::from_static(b"!\r\n"),
        }
    }
}

impl Framing {
    pub fn new(prefix: impl Into<Bytes>, suffix: impl Into<Bytes>) -> Self {
        Framing {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    /// No prefix, no suffix.
    pub fn raw() -> Self {
        Framing::new(Bytes::new(), Bytes::new())
    }

    pub fn wrap(&self, payload: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(self.prefix.len() + payload.len() + self.suffix.len());
        out.extend_from_slice(&self.prefix);
        out.extend_from_slice(payload);
        out.extend_from_slice(&self.suffix);
        out.freeze()
    }
}

/// How inbound messages are delimited.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Delimiter {
    /// Any unescaped `\r`, `\n`, or `\r\n`.
    #[default]
    LineEnding,
    /// An exact byte sequence.
    Sequence(Bytes),
}

/// Result of scanning the buffer for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    /// The message body is `buf[..end]`; `consumed` bytes include the delimiter.
    Message { end: usize, consumed: usize },
    Incomplete,
}

/// Accumulates inbound bytes and extracts complete messages.
#[derive(Debug, Clone)]
pub struct Framer {
    buf: BytesMut,
    delimiter: Delimiter,
    max_len: usize,
}

impl Default for Framer {
    fn default() -> Self {
        Framer::new(Delimiter::default(), DEFAULT_MAX_FRAME_LEN)
    }
}

impl Framer {
    pub fn new(delimiter: Delimiter, max_len: usize) -> Self {
        Framer {
            buf: BytesMut::new(),
            delimiter,
            max_len: max_len.max(1),
        }
    }

    /// Append inbound bytes.
    ///
    /// If the buffer would grow past the cap without yielding a message, it
    /// is reset rather than left to grow on line noise.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > self.max_len && self.scan() == Scan::Incomplete {
            warn!(len = self.buf.len(), "receive buffer overflow, resetting");
            self.buf.clear();
        }
    }

    /// Remove and return the next complete message, if any.
    ///
    /// Calling this until it returns `None` drains every complete message;
    /// a partial trailing message stays buffered for the next [`feed`](Self::feed).
    pub fn extract_next(&mut self) -> Option<Bytes> {
        loop {
            match self.scan() {
                Scan::Message { end, consumed } => {
                    let mut frame = self.buf.split_to(consumed);
                    frame.truncate(end);
                    if frame.is_empty() {
                        continue;
                    }
                    let message = frame.freeze();
                    trace!(message = ?message, "framed inbound message");
                    return Some(message);
                }
                Scan::Incomplete => return None,
            }
        }
    }

    /// Discard everything buffered.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Number of bytes waiting for a delimiter.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn set_delimiter(&mut self, delimiter: Delimiter) {
        self.delimiter = delimiter;
    }

    pub fn set_max_len(&mut self, max_len: usize) {
        self.max_len = max_len.max(1);
    }

    fn scan(&self) -> Scan {
        match &self.delimiter {
            Delimiter::LineEnding => scan_line_ending(&self.buf),
            Delimiter::Sequence(seq) => scan_sequence(&self.buf, seq),
        }
    }
}

fn scan_line_ending(buf: &[u8]) -> Scan {
    for (i, &b) in buf.iter().enumerate() {
        if (b == b'\r' || b == b'\n') && !is_escaped(buf, i) {
            let consumed = if b == b'\r' && buf.get(i + 1) == Some(&b'\n') {
                i + 2
            } else {
                i + 1
            };
            return Scan::Message { end: i, consumed };
        }
    }
    Scan::Incomplete
}

fn scan_sequence(buf: &[u8], seq: &[u8]) -> Scan {
    if seq.is_empty() || buf.len() < seq.len() {
        return Scan::Incomplete;
    }
    let mut from = 0;
    while let Some(pos) = buf[from..].windows(seq.len()).position(|w| w == seq) {
        let at = from + pos;
        if !is_escaped(buf, at) {
            return Scan::Message {
                end: at,
                consumed: at + seq.len(),
            };
        }
        from = at + 1;
    }
    Scan::Incomplete
}

/// A byte is escaped when preceded by an odd run of backslashes.
fn is_escaped(buf: &[u8], at: usize) -> bool {
    buf[..at].iter().rev().take_while(|&&b| b == b'\\').count() % 2 == 1
}
