//! RESP Protocol Implementation
//!
//! ## Modules
//!
//! - `types`: the `RespValue` enum and its encoder
//! - `parser`: stateless parser for one value at the start of a slice
//! - `codec`: long-lived per-connection decoder and snapshot transfer framing
//!
//! ## Example
//!
//! ```
//! use relaykv::protocol::{RespDecoder, RespValue};
//!
//! let mut decoder = RespDecoder::new();
//! decoder.extend(b"*2\r\n$3\r\nGET\r\n");
//! assert!(decoder.decode().is_none());
//!
//! decoder.extend(b"$4\r\nname\r\n");
//! assert_eq!(decoder.decode(), Some(RespValue::command(["GET", "name"])));
//! ```

pub mod codec;
pub mod parser;
pub mod types;

pub use codec::{encode_raw_payload, RespDecoder};
pub use parser::{parse_message, ParseError, ParseResult, RespParser};
pub use types::RespValue;
