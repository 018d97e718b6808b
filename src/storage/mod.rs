//! Storage Module
//!
//! A thread-safe, sharded key-value store with per-key expiry, plus the
//! background sweeper that reclaims expired entries.
//!
//! ```text
//!   connections ──┐
//!                 ├──> StorageEngine (64 RwLock shards) <── ExpirySweeper
//!   replica link ─┘
//! ```
//!
//! ## Example
//!
//! ```
//! use relaykv::storage::StorageEngine;
//! use bytes::Bytes;
//! use std::time::Duration;
//!
//! let engine = StorageEngine::new();
//! engine.set(Bytes::from("session"), Bytes::from("token123"), Some(Duration::from_secs(3600)));
//! assert_eq!(engine.get(&Bytes::from("session")), Some(Bytes::from("token123")));
//! ```

pub mod engine;
pub mod expiry;

pub use engine::{
    is_reserved, Entry, StorageEngine, StorageError, REPLICATION_ID_KEY, REPLICATION_OFFSET_KEY,
};
pub use expiry::{ExpirySweeper, SweepConfig};
