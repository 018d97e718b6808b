//! Snapshot Loading
//!
//! At startup the store can be pre-populated from a binary snapshot
//! (`dir/dbfilename`). Only reading is supported; the same bytes are later
//! handed to replicas during a full resync.
//!
//! ```text
//! ┌────────────┬──────┬────┬──────┬──────┬──────┬──────────────────┬──────┐
//! │ header/aux │ 0xFE │ db │ resv │ hash │ exp  │ entries ...      │ 0xFF │
//! └────────────┴──────┴────┴──────┴──────┴──────┴──────────────────┴──────┘
//!   skipped                   hints are informational
//! ```

pub mod loader;

pub use loader::{load, load_file, LoadReport};

use thiserror::Error;

/// Errors raised while reading a snapshot.
///
/// None of these is fatal: whatever was parsed before the error stays loaded.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// No select-database marker (0xFE); the snapshot holds no data
    #[error("snapshot has no database section")]
    MissingDatabase,

    #[error("snapshot truncated at byte {offset}")]
    Truncated { offset: usize },

    #[error("unsupported value type 0x{value_type:02x} at byte {offset}")]
    UnsupportedValueType { offset: usize, value_type: u8 },

    #[error("failed to read snapshot: {0}")]
    Io(#[from] std::io::Error),
}

/// A valid snapshot with no database section, sent to replicas when no file
/// was loaded at startup.
pub const EMPTY_SNAPSHOT: &[u8] = &[
    0x52, 0x45, 0x44, 0x49, 0x53, 0x30, 0x30, 0x31, 0x31, 0xfa, 0x09, 0x72,
    0x65, 0x64, 0x69, 0x73, 0x2d, 0x76, 0x65, 0x72, 0x05, 0x37, 0x2e, 0x32,
    0x2e, 0x30, 0xfa, 0x0a, 0x72, 0x65, 0x64, 0x69, 0x73, 0x2d, 0x62, 0x69,
    0x74, 0x73, 0xc0, 0x40, 0xfa, 0x05, 0x63, 0x74, 0x69, 0x6d, 0x65, 0xc2,
    0x6d, 0x08, 0xbc, 0x65, 0xfa, 0x08, 0x75, 0x73, 0x65, 0x64, 0x2d, 0x6d,
    0x65, 0x6d, 0xc2, 0xb0, 0xc4, 0x10, 0x00, 0xfa, 0x08, 0x61, 0x6f, 0x66,
    0x2d, 0x62, 0x61, 0x73, 0x65, 0xc0, 0x00, 0xff, 0xf0, 0x6e, 0x3b, 0xfe,
    0xc0, 0xff, 0x5a, 0xa2,
];
