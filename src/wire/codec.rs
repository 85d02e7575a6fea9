//! Line framing and command encoding.
//!
//! [`LineDecoder`] reassembles newline-terminated lines from arbitrary read
//! chunks. [`OutputBuffer`] keeps the unsent suffix of encoded commands until
//! the socket accepts it.

use bytes::{Buf, BytesMut};

use crate::error::EngineError;
use crate::request::Command;

/// Default maximum line length (1 MiB).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024 * 1024;

const NEWLINE: u8 = b'\n';

/// Incremental line decoder that handles partial reads.
///
/// Push bytes with [`LineDecoder::push`] and pull lines with
/// [`LineDecoder::next_line`], or do both at once with [`LineDecoder::feed`].
/// Pulling is lazy: lines stay buffered until asked for, so a consumer can
/// stop halfway (e.g. after a fatal protocol error) and [`LineDecoder::clear`]
/// the rest.
#[derive(Debug)]
pub struct LineDecoder {
    buf: BytesMut,
    /// Bytes already scanned for a newline (avoids rescanning on each push).
    scanned: usize,
    max_line_length: usize,
}

impl LineDecoder {
    /// Create a decoder with the default line limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_line_length(DEFAULT_MAX_LINE_LENGTH)
    }

    /// Create a decoder rejecting lines longer than `max_line_length` bytes.
    #[must_use]
    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            scanned: 0,
            max_line_length,
        }
    }

    /// Append raw bytes read from the socket.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete line, without its terminator.
    ///
    /// Returns `Ok(None)` when only a partial line is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Protocol`] if a line exceeds the length limit or
    /// is not valid UTF-8.
    pub fn next_line(&mut self) -> Result<Option<String>, EngineError> {
        let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == NEWLINE) else {
            self.scanned = self.buf.len();
            if self.buf.len() > self.max_line_length {
                return Err(EngineError::Protocol(format!(
                    "Line exceeds {} bytes without terminator",
                    self.max_line_length
                )));
            }
            return Ok(None);
        };

        let end = self.scanned + offset;
        self.scanned = 0;
        if end > self.max_line_length {
            return Err(EngineError::Protocol(format!(
                "Line of {end} bytes exceeds limit of {}",
                self.max_line_length
            )));
        }

        let mut raw = self.buf.split_to(end + 1);
        raw.truncate(end);
        if raw.last() == Some(&b'\r') {
            raw.truncate(end - 1);
        }

        String::from_utf8(raw.to_vec())
            .map(Some)
            .map_err(|e| EngineError::Protocol(format!("Line is not valid UTF-8: {e}")))
    }

    /// Feed bytes and extract all complete lines.
    ///
    /// Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// See [`LineDecoder::next_line`].
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<String>, EngineError> {
        self.push(bytes);
        let mut lines = Vec::new();
        while let Some(line) = self.next_line()? {
            lines.push(line);
        }
        Ok(lines)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Outgoing bytes not yet accepted by the socket.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    pending: BytesMut,
}

impl OutputBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes behind anything still unsent.
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Bytes waiting to be written.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Mark `n` leading bytes as written.
    pub fn consume(&mut self, n: usize) {
        self.pending.advance(n.min(self.pending.len()));
    }

    /// Whether everything has been written.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop everything unsent.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Encode a command into its wire form, including the trailing newline.
///
/// Arguments that are empty or contain whitespace, quotes or backslashes are
/// wrapped in double quotes with `"` and `\` escaped.
pub fn encode(command: &Command) -> Vec<u8> {
    let mut out = String::with_capacity(command.name().len() + 1);
    out.push_str(command.name());
    for arg in command.arg_list() {
        out.push(' ');
        push_argument(&mut out, arg);
    }
    out.push('\n');
    out.into_bytes()
}

fn push_argument(out: &mut String, arg: &str) {
    let needs_quotes = arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\\' || c == '\'');
    if !needs_quotes {
        out.push_str(arg);
        return;
    }

    out.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
}
