//! Per-Connection Decoder
//!
//! TCP is a byte stream: one read may carry half a command, or three
//! commands and the start of a fourth. A [`RespDecoder`] lives as long as its
//! connection and keeps the unconsumed bytes between reads, so a frame split
//! across reads is reassembled instead of lost.
//!
//! ```text
//!   read() ──> extend buffer ──> next_frame() ──> Some((value, len))  consume len bytes
//!                                      │
//!                                      └──────> None                  keep everything, read again
//! ```
//!
//! A stream that can never become valid (unknown prefix, garbage length)
//! stalls: the decoder keeps returning `None` and the bytes stay buffered.

use crate::protocol::parser::{parse_length, ParseError, RespParser};
use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::{Bytes, BytesMut};
use tracing::debug;

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Incremental decoder owning a connection's inbound buffer.
#[derive(Debug)]
pub struct RespDecoder {
    buffer: BytesMut,
    parser: RespParser,
    /// Set once a structural error has been logged, cleared when progress resumes
    stalled: bool,
}

impl Default for RespDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RespDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            parser: RespParser::new(),
            stalled: false,
        }
    }

    /// Appends freshly read bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Direct access to the buffer so sockets can `read_buf` into it.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Number of bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Decodes the next complete value, if one is buffered.
    pub fn decode(&mut self) -> Option<RespValue> {
        self.next_frame().map(|(value, _)| value)
    }

    /// Decodes the next complete value together with its length on the wire.
    pub fn next_frame(&mut self) -> Option<(RespValue, usize)> {
        if self.buffer.is_empty() {
            return None;
        }

        match self.parser.parse(&self.buffer) {
            Ok(Some((value, consumed))) => {
                let _ = self.buffer.split_to(consumed);
                self.stalled = false;
                Some((value, consumed))
            }
            Ok(None) => None,
            Err(e) => {
                self.note_stall(&e);
                None
            }
        }
    }

    /// Decodes the unterminated `$<len>\r\n<len bytes>` transfer that follows
    /// `FULLRESYNC`.
    ///
    /// Unlike a bulk string there is no trailing CRLF, so the regular parser
    /// cannot be used; the length prefix alone delimits the payload.
    pub fn decode_raw_payload(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            return None;
        }
        if self.buffer[0] != prefix::BULK_STRING {
            self.note_stall(&ParseError::UnknownPrefix(self.buffer[0]));
            return None;
        }

        let (length, header_len) = match parse_length(&self.buffer) {
            Ok(Some(header)) => header,
            Ok(None) => return None,
            Err(e) => {
                self.note_stall(&e);
                return None;
            }
        };
        if length < 0 {
            self.note_stall(&ParseError::InvalidBulkLength(length));
            return None;
        }

        let length = length as usize;
        if self.buffer.len() < header_len + length {
            return None;
        }

        let _ = self.buffer.split_to(header_len);
        self.stalled = false;
        Some(self.buffer.split_to(length).freeze())
    }

    fn note_stall(&mut self, error: &ParseError) {
        if !self.stalled {
            debug!(error = %error, buffered = self.buffer.len(), "Undecodable input, waiting");
            self.stalled = true;
        }
    }
}

/// Frames a snapshot transfer as `$<len>\r\n<bytes>` with no trailing CRLF.
pub fn encode_raw_payload(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + 16);
    buf.push(prefix::BULK_STRING);
    buf.extend_from_slice(payload.len().to_string().as_bytes());
    buf.extend_from_slice(CRLF);
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_split_across_reads() {
        let wire = b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n";

        // Every possible split point must reassemble the same command.
        for split in 1..wire.len() {
            let mut decoder = RespDecoder::new();
            decoder.extend(&wire[..split]);
            assert_eq!(decoder.decode(), None, "split at {}", split);
            assert_eq!(decoder.buffered(), split);

            decoder.extend(&wire[split..]);
            assert_eq!(decoder.decode(), Some(RespValue::command(["SET", "foo", "bar"])));
            assert!(decoder.is_empty());
        }
    }

    #[test]
    fn test_decode_byte_at_a_time() {
        let wire = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n";
        let mut decoder = RespDecoder::new();
        let mut decoded = Vec::new();
        for byte in wire.iter() {
            decoder.extend(&[*byte]);
            if let Some(value) = decoder.decode() {
                decoded.push(value);
            }
        }
        assert_eq!(decoded, vec![RespValue::command(["GET", "foo"])]);
    }

    #[test]
    fn test_decode_pipelined() {
        let mut decoder = RespDecoder::new();
        decoder.extend(b"+PONG\r\n+OK\r\n:5\r\n$2\r\nhi");

        assert_eq!(decoder.next_frame(), Some((RespValue::pong(), 7)));
        assert_eq!(decoder.next_frame(), Some((RespValue::ok(), 5)));
        assert_eq!(decoder.decode(), Some(RespValue::integer(5)));
        assert_eq!(decoder.decode(), None);

        decoder.extend(b"\r\n");
        assert_eq!(decoder.decode(), Some(RespValue::bulk_string("hi")));
    }

    #[test]
    fn test_invalid_prefix_stalls_without_consuming() {
        let mut decoder = RespDecoder::new();
        decoder.extend(b"?garbage\r\n");
        assert_eq!(decoder.decode(), None);
        assert_eq!(decoder.buffered(), 10);

        decoder.extend(b"*1\r\n$4\r\nPING\r\n");
        assert_eq!(decoder.decode(), None);
        assert_eq!(decoder.buffered(), 24);
    }

    #[test]
    fn test_raw_payload_without_trailing_crlf() {
        // The payload contains bytes that look like protocol markers.
        let payload = b"REDIS\xfe\x00*3\r\n\xff12345678";
        let mut wire = encode_raw_payload(payload);
        wire.extend_from_slice(b"*1\r\n$4\r\nPING\r\n");

        let mut decoder = RespDecoder::new();
        decoder.extend(&wire[..6]);
        assert_eq!(decoder.decode_raw_payload(), None);

        decoder.extend(&wire[6..]);
        assert_eq!(decoder.decode_raw_payload(), Some(Bytes::from_static(payload)));
        assert_eq!(decoder.decode(), Some(RespValue::command(["PING"])));
    }

    #[test]
    fn test_raw_payload_rejects_other_prefixes() {
        let mut decoder = RespDecoder::new();
        decoder.extend(b"+OK\r\n");
        assert_eq!(decoder.decode_raw_payload(), None);
        assert_eq!(decoder.decode(), Some(RespValue::ok()));
    }
}
