//! Incremental NDJSON parsing
//!
//! [`NdjsonParser`] is a single-pass line splitter that consumes
//! arbitrary-sized byte chunks and yields one parsed JSON value per line.
//! It is the decoding stage between a download's raw byte stream and the
//! per-record resource validation performed by the owning task.
//!
//! The parser is strict and fails permanently: any JSON syntax error or
//! buffer overflow poisons it, the internal buffer is cleared, and further
//! input is rejected. Records already yielded are not retracted.

use crate::error::{Error, ParseError, Result};
use serde_json::Value;

/// Default cap on bytes buffered while waiting for a line break (1 MiB)
pub const DEFAULT_MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Streaming NDJSON parser
///
/// Feed raw chunks with [`push`](Self::push); call
/// [`finish`](Self::finish) at end of input to flush a trailing line that
/// has no terminating newline.
///
/// Blank (zero-length) lines are skipped silently but still advance the
/// line counter, so syntax errors always cite the physical 1-based line
/// number of the input.
#[derive(Debug)]
pub struct NdjsonParser {
    /// Bytes accumulated since the last newline
    buffer: Vec<u8>,
    /// Physical lines consumed so far
    line_count: u64,
    /// Overflow protection limit for `buffer`
    max_line_length: usize,
    /// Set once a syntax error or overflow poisons the parser
    failed: bool,
}

impl NdjsonParser {
    /// Create a parser with an explicit buffered-line length limit
    pub fn new(max_line_length: usize) -> Self {
        Self {
            buffer: Vec::new(),
            line_count: 0,
            max_line_length,
            failed: false,
        }
    }

    /// Number of physical lines consumed so far (blank lines included)
    pub fn lines(&self) -> u64 {
        self.line_count
    }

    /// Consume one chunk of raw bytes, returning every complete JSON value
    /// terminated by a newline inside it.
    ///
    /// The overflow limit is enforced on the accumulated buffer before any
    /// line is sliced off, so an oversized chunk fails before emitting
    /// records from it.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Value>> {
        if self.failed {
            return Err(Error::Parse(ParseError::Terminated));
        }

        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > self.max_line_length {
            let length = self.buffer.len();
            return Err(self.fail(ParseError::BufferOverflow {
                limit: self.max_line_length,
                length,
            }));
        }

        let mut values = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).take(pos).collect();
            self.line_count += 1;
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice(&line) {
                Ok(value) => values.push(value),
                Err(e) => {
                    return Err(self.fail(ParseError::Syntax {
                        line: self.line_count,
                        message: e.to_string(),
                    }));
                }
            }
        }
        Ok(values)
    }

    /// Flush the trailing buffer at end of input.
    ///
    /// A non-empty trailing buffer (input without a final newline) is parsed
    /// as one last JSON value; a parse failure here is reported against line
    /// N+1 where N is the number of newline-terminated lines seen.
    pub fn finish(&mut self) -> Result<Option<Value>> {
        if self.failed {
            return Err(Error::Parse(ParseError::Terminated));
        }
        if self.buffer.is_empty() {
            return Ok(None);
        }

        self.line_count += 1;
        let line = std::mem::take(&mut self.buffer);
        match serde_json::from_slice(&line) {
            Ok(value) => Ok(Some(value)),
            Err(e) => Err(self.fail(ParseError::Syntax {
                line: self.line_count,
                message: e.to_string(),
            })),
        }
    }

    /// Poison the parser and clear its buffer
    fn fail(&mut self, error: ParseError) -> Error {
        self.failed = true;
        self.buffer.clear();
        Error::Parse(error)
    }
}

impl Default for NdjsonParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}
