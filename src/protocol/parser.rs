//! Incremental Command Parser
//!
//! Requests arrive as a byte stream. The parser looks at whatever is buffered
//! and returns either:
//! - `Ok(Some((command, consumed)))` - a complete frame, `consumed` bytes long
//! - `Ok(None)` - the frame is incomplete, read more and try again
//! - `Err(ParseError)` - the bytes can never form a valid frame
//!
//! The caller advances its buffer by exactly `consumed`, which is also the
//! number replicas add to their replication offset.
//!
//! ## Accepted frames
//!
//! - `+<text>\r\n` - the rest of the line is the only argument
//! - `$<len>\r\n<data>\r\n` - a single argument; the two bytes after the
//!   payload are consumed without being checked
//! - `*<n>\r\n` followed by `n` bulk strings - a full argument vector
//! - anything else - a zero-argument command spanning one line

use crate::protocol::types::{prefix, Command};
use bytes::Bytes;
use std::num::ParseIntError;
use thiserror::Error;

/// Errors that can occur while parsing request frames.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Invalid integer in a length or count header
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Bulk string length is negative
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Array length is negative
    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    /// Protocol violation (array element that is not a bulk string, etc.)
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The frame exceeds the maximum allowed size
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Upper bound on pre-allocated argument slots for one array header.
const MAX_PREALLOC_ARGS: usize = 1024;

/// Parser for request frames.
///
/// # Example
///
/// ```
/// use relaykv::protocol::CommandParser;
///
/// let parser = CommandParser::new();
/// let (command, consumed) = parser
///     .parse(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n")
///     .unwrap()
///     .unwrap();
/// assert_eq!(command.name(), "get");
/// assert_eq!(consumed, 23);
/// ```
#[derive(Debug, Clone)]
pub struct CommandParser {
    max_bulk_size: usize,
}

impl Default for CommandParser {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandParser {
    /// Creates a parser with the default bulk size limit.
    pub fn new() -> Self {
        Self {
            max_bulk_size: MAX_BULK_SIZE,
        }
    }

    /// Creates a parser with a custom bulk size limit.
    pub fn with_max_bulk_size(max_bulk_size: usize) -> Self {
        Self { max_bulk_size }
    }

    /// Attempts to parse one command from the start of `buf`.
    pub fn parse(&self, buf: &[u8]) -> ParseResult<Option<(Command, usize)>> {
        let line_end = match find_crlf(buf) {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let header_len = line_end + 2;

        let parsed = match buf.first() {
            Some(&prefix::SIMPLE_STRING) => {
                let text = Bytes::copy_from_slice(&buf[1..line_end]);
                Some((vec![text], header_len))
            }
            Some(&prefix::BULK_STRING) => self
                .parse_bulk_string(buf)?
                .map(|(arg, consumed)| (vec![arg], consumed)),
            Some(&prefix::ARRAY) => self.parse_array(buf, line_end)?,
            _ => Some((Vec::new(), header_len)),
        };

        Ok(parsed.map(|(args, consumed)| (Command::new(args, consumed), consumed)))
    }

    /// Parses `$<len>\r\n<data><2 bytes>` into one argument.
    fn parse_bulk_string(&self, buf: &[u8]) -> ParseResult<Option<(Bytes, usize)>> {
        match buf.first() {
            Some(&prefix::BULK_STRING) => {}
            Some(&other) => {
                return Err(ParseError::ProtocolError(format!(
                    "expected bulk string, found prefix {:#04x}",
                    other
                )))
            }
            None => return Ok(None),
        }

        let (length, data_start) = match self.parse_length(buf)? {
            Some(header) => header,
            None => return Ok(None),
        };

        // Payload plus the two terminator bytes, which are taken on trust.
        let total_needed = data_start + length + 2;
        if buf.len() < total_needed {
            return Ok(None);
        }

        let arg = Bytes::copy_from_slice(&buf[data_start..data_start + length]);
        Ok(Some((arg, total_needed)))
    }

    /// Parses `*<count>\r\n` followed by `count` bulk strings.
    fn parse_array(
        &self,
        buf: &[u8],
        line_end: usize,
    ) -> ParseResult<Option<(Vec<Bytes>, usize)>> {
        let count = parse_int(&buf[1..line_end])?;
        if count < 0 {
            return Err(ParseError::InvalidArrayLength(count));
        }
        let count = count as usize;

        let mut args = Vec::with_capacity(count.min(MAX_PREALLOC_ARGS));
        let mut consumed = line_end + 2;

        for _ in 0..count {
            match self.parse_bulk_string(&buf[consumed..])? {
                Some((arg, element_consumed)) => {
                    args.push(arg);
                    consumed += element_consumed;
                }
                None => return Ok(None),
            }
        }

        Ok(Some((args, consumed)))
    }

    /// Parses a `$<len>\r\n` header, returning the length and data offset.
    fn parse_length(&self, buf: &[u8]) -> ParseResult<Option<(usize, usize)>> {
        let length_end = match find_crlf(&buf[1..]) {
            Some(pos) => pos,
            None => return Ok(None),
        };

        let length = parse_int(&buf[1..1 + length_end])?;
        if length < 0 {
            return Err(ParseError::InvalidBulkLength(length));
        }

        let length = length as usize;
        if length > self.max_bulk_size {
            return Err(ParseError::MessageTooLarge {
                size: length,
                max: self.max_bulk_size,
            });
        }

        Ok(Some((length, 1 + length_end + 2)))
    }

    /// Parses a snapshot file frame: `$<len>\r\n<raw bytes>`.
    ///
    /// Unlike a bulk string there is no trailing CRLF after the payload.
    pub fn parse_file(&self, buf: &[u8]) -> ParseResult<Option<(Bytes, usize)>> {
        match buf.first() {
            Some(&prefix::BULK_STRING) => {}
            Some(&other) => {
                return Err(ParseError::ProtocolError(format!(
                    "expected snapshot payload, found prefix {:#04x}",
                    other
                )))
            }
            None => return Ok(None),
        }

        let (length, data_start) = match self.parse_length(buf)? {
            Some(header) => header,
            None => return Ok(None),
        };

        let total_needed = data_start + length;
        if buf.len() < total_needed {
            return Ok(None);
        }

        let data = Bytes::copy_from_slice(&buf[data_start..total_needed]);
        Ok(Some((data, total_needed)))
    }
}

/// Finds the position of CRLF in the buffer.
///
/// Returns the position of `\r` if found, or None if CRLF is not present.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == b"\r\n")
}

fn parse_int(raw: &[u8]) -> ParseResult<i64> {
    let s = std::str::from_utf8(raw)
        .map_err(|_| ParseError::InvalidInteger(String::from_utf8_lossy(raw).into_owned()))?;
    s.trim()
        .parse()
        .map_err(|e: ParseIntError| ParseError::InvalidInteger(e.to_string()))
}

/// Helper function to parse a single command from bytes.
pub fn parse_command(buf: &[u8]) -> ParseResult<Option<(Command, usize)>> {
    CommandParser::new().parse(buf)
}

/// Helper function to parse a single snapshot file frame from bytes.
pub fn parse_file_frame(buf: &[u8]) -> ParseResult<Option<(Bytes, usize)>> {
    CommandParser::new().parse_file(buf)
}
