//! Single-Leader Replication
//!
//! ```text
//!          leader                                      replica
//!   ┌──────────────────┐  PING / REPLCONF / PSYNC  ┌──────────────────┐
//!   │ ReplicaRegistry  │ <──────────────────────── │ Handshake        │
//!   │                  │ ──FULLRESYNC + snapshot─> │                  │
//!   │ commit(SET)      │ ──SET k v [PX ms]───────> │ apply_replicated │
//!   └──────────────────┘                           └──────────────────┘
//! ```
//!
//! - `registry`: leader side, fans committed writes out to replicas
//! - `handshake`: replica side state machine, no I/O
//! - `replica`: replica side session and reconnecting link task

pub mod handshake;
pub mod registry;
pub mod replica;

pub use handshake::{FullResync, Handshake, HandshakeState, Step};
pub use registry::{ReplicaId, ReplicaRegistry, ReplicaSubscription};
pub use replica::{ReplicaLink, ReplicaSession};

use crate::config::ReplicaOf;
use crate::storage::StorageEngine;
use rand::RngCore;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// The role a process plays, fixed at startup.
#[derive(Debug, Clone)]
pub enum ReplicationRole {
    Leader(Arc<ReplicaRegistry>),
    /// Follows the leader at this address
    Replica(ReplicaOf),
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("leader closed the connection")]
    LeaderClosed,
}

/// Generates a fresh 40 character hex replication id.
pub fn generate_replication_id() -> String {
    let mut raw = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut raw);
    hex::encode(raw)
}

/// Stamps a leader's store with a new replication id and offset 0.
pub fn bootstrap_leader(storage: &StorageEngine) -> String {
    let id = generate_replication_id();
    storage.set_replication_meta(&id, 0);
    info!(replication_id = %id, "Leader replication id assigned");
    id
}
