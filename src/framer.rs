//! Incremental line framing for the command stream.
//!
//! Bytes arrive from the socket in arbitrary chunks. The framer buffers
//! them and yields complete, trimmed, non-empty lines:
//!
//! ```text
//! "FRA"        -> (nothing yet)
//! "ME 3\r\n\n" -> "FRAME 3"
//! ```
//!
//! A line ends at `\n`; a preceding `\r` is stripped along with any other
//! surrounding whitespace. Lines must be 7-bit ASCII.

use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Default maximum line length in bytes (excluding the terminator).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 4096;

/// Errors for a single line. The line is dropped; framing continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("line contains non-ASCII bytes")]
    NonAscii,
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
}

/// Buffers a byte stream and splits it into command lines.
///
/// The framer is an iterator: it returns `None` once no complete line is
/// buffered, and yields again after more bytes are passed to [`extend`].
///
/// [`extend`]: LineFramer::extend
#[derive(Debug)]
pub struct LineFramer {
    buffer: BytesMut,
    max_line_length: usize,
    /// Set while skipping the tail of an oversized line.
    discarding: bool,
}

impl LineFramer {
    pub fn new(max_line_length: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
            max_line_length,
            discarding: false,
        }
    }

    /// Append a chunk read from the socket.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Number of buffered bytes not yet returned as a line.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Take the unterminated remainder after the peer closed its write half.
    pub fn finish(&mut self) -> Option<Result<String, FrameError>> {
        if self.discarding {
            self.discarding = false;
            self.buffer.clear();
            return None;
        }
        if self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split();
        decode_line(&rest)
    }

    fn next_frame(&mut self) -> Option<Result<String, FrameError>> {
        loop {
            let Some(pos) = find_lf(&self.buffer) else {
                if !self.discarding && content_len(&self.buffer) > self.max_line_length {
                    self.discarding = true;
                    self.buffer.clear();
                    return Some(Err(FrameError::LineTooLong(self.max_line_length)));
                }
                if self.discarding {
                    self.buffer.clear();
                }
                return None;
            };

            let line = self.buffer.split_to(pos);
            self.buffer.advance(1);

            if self.discarding {
                // Tail of an oversized line, already reported.
                self.discarding = false;
                continue;
            }
            if content_len(&line) > self.max_line_length {
                return Some(Err(FrameError::LineTooLong(self.max_line_length)));
            }
            if let Some(frame) = decode_line(&line) {
                return Some(frame);
            }
        }
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

impl Iterator for LineFramer {
    type Item = Result<String, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame()
    }
}

/// Decode one raw line. Blank lines yield `None`.
fn decode_line(raw: &[u8]) -> Option<Result<String, FrameError>> {
    if !raw.is_ascii() {
        return Some(Err(FrameError::NonAscii));
    }
    let trimmed = raw.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }
    // ASCII is valid UTF-8.
    Some(Ok(String::from_utf8_lossy(trimmed).into_owned()))
}

/// Length of a raw line without its `\r` terminator.
fn content_len(raw: &[u8]) -> usize {
    raw.strip_suffix(b"\r").map_or(raw.len(), <[u8]>::len)
}

/// Find `\n` in buffer.
fn find_lf(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == b'\n')
}
