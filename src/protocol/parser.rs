//! Incremental RESP Parser
//!
//! The parser looks at a byte slice and reports one of three outcomes:
//!
//! - `Ok(Some((value, consumed)))` - a complete value, `consumed` bytes long
//! - `Ok(None)` - the value is not complete yet, wait for more bytes
//! - `Err(ParseError)` - the bytes can never form a valid value
//!
//! It never consumes anything itself; the caller ([`crate::protocol::RespDecoder`])
//! owns the buffer and advances it by `consumed`.

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::Bytes;
use std::num::ParseIntError;
use thiserror::Error;

/// Errors that can occur during RESP parsing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Unknown type prefix byte
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    /// Invalid integer or length field
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid UTF-8 in a simple string, error or length line
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Bulk string length is negative (but not -1 for null)
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Array length is negative (but not -1 for null)
    #[error("invalid array length: {0}")]
    InvalidArrayLength(i64),

    /// Protocol violation (missing CRLF, nesting too deep, ...)
    #[error("protocol error: {0}")]
    ProtocolError(String),
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum array nesting depth (prevent stack overflow)
pub const MAX_NESTING_DEPTH: usize = 32;

/// A RESP protocol parser.
///
/// # Example
///
/// ```
/// use relaykv::protocol::{RespParser, RespValue};
///
/// let mut parser = RespParser::new();
/// let (value, consumed) = parser.parse(b"+OK\r\n").unwrap().unwrap();
/// assert_eq!(value, RespValue::ok());
/// assert_eq!(consumed, 5);
/// ```
#[derive(Debug, Default)]
pub struct RespParser {
    /// Current nesting depth (for array parsing)
    depth: usize,
}

impl RespParser {
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Attempts to parse one RESP value from the start of `buf`.
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        self.depth = 0;
        self.parse_value(buf)
    }

    fn parse_value(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }

        if self.depth > MAX_NESTING_DEPTH {
            return Err(ParseError::ProtocolError(format!(
                "maximum nesting depth exceeded: {}",
                MAX_NESTING_DEPTH
            )));
        }

        match buf[0] {
            prefix::SIMPLE_STRING => {
                Ok(parse_line(buf)?.map(|(s, n)| (RespValue::SimpleString(s.to_string()), n)))
            }
            prefix::ERROR => Ok(parse_line(buf)?.map(|(s, n)| (RespValue::Error(s.to_string()), n))),
            prefix::INTEGER => match parse_line(buf)? {
                Some((s, n)) => Ok(Some((RespValue::Integer(parse_i64(s)?), n))),
                None => Ok(None),
            },
            prefix::BULK_STRING => self.parse_bulk_string(buf),
            prefix::ARRAY => self.parse_array(buf),
            other => Err(ParseError::UnknownPrefix(other)),
        }
    }

    /// Parses a bulk string: `$<length>\r\n<data>\r\n`
    fn parse_bulk_string(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let (length, header_len) = match parse_length(buf)? {
            Some(header) => header,
            None => return Ok(None),
        };

        if length == -1 {
            return Ok(Some((RespValue::Null, header_len)));
        }
        if length < 0 {
            return Err(ParseError::InvalidBulkLength(length));
        }

        let length = length as usize;
        let total_needed = header_len + length + 2;
        if buf.len() < total_needed {
            return Ok(None);
        }

        if &buf[header_len + length..total_needed] != CRLF {
            return Err(ParseError::ProtocolError(
                "bulk string missing trailing CRLF".to_string(),
            ));
        }

        let data = Bytes::copy_from_slice(&buf[header_len..header_len + length]);
        Ok(Some((RespValue::BulkString(data), total_needed)))
    }

    /// Parses an array: `*<count>\r\n<elements...>`
    fn parse_array(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let (count, mut consumed) = match parse_length(buf)? {
            Some(header) => header,
            None => return Ok(None),
        };

        if count == -1 {
            return Ok(Some((RespValue::Null, consumed)));
        }
        if count < 0 {
            return Err(ParseError::InvalidArrayLength(count));
        }

        let count = count as usize;
        let mut elements = Vec::with_capacity(count.min(1024));

        self.depth += 1;
        for _ in 0..count {
            match self.parse_value(&buf[consumed..])? {
                Some((value, element_consumed)) => {
                    elements.push(value);
                    consumed += element_consumed;
                }
                None => {
                    self.depth -= 1;
                    return Ok(None);
                }
            }
        }
        self.depth -= 1;

        Ok(Some((RespValue::Array(elements), consumed)))
    }
}

/// Reads the CRLF-terminated line after the prefix byte.
///
/// Returns the line text and the number of bytes including prefix and CRLF.
fn parse_line(buf: &[u8]) -> ParseResult<Option<(&str, usize)>> {
    match find_crlf(&buf[1..]) {
        Some(pos) => {
            let s = std::str::from_utf8(&buf[1..1 + pos])
                .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
            Ok(Some((s, 1 + pos + 2)))
        }
        None => Ok(None),
    }
}

/// Reads a `$`/`*` length header, returning the length and the header size.
pub(crate) fn parse_length(buf: &[u8]) -> ParseResult<Option<(i64, usize)>> {
    match parse_line(buf)? {
        Some((s, header_len)) => Ok(Some((parse_i64(s)?, header_len))),
        None => Ok(None),
    }
}

fn parse_i64(s: &str) -> ParseResult<i64> {
    s.parse()
        .map_err(|e: ParseIntError| ParseError::InvalidInteger(e.to_string()))
}

/// Finds the position of CRLF in the buffer.
///
/// Returns the position of `\r` if found, or None if CRLF is not present.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Parses a single RESP message from bytes with a fresh parser.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    RespParser::new().parse(buf)
}
