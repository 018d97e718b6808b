//! Command Handler Module
//!
//! Receives decoded RESP requests, executes them against the storage engine
//! and returns the reply to send back.
//!
//! ```text
//! Client Request / Leader Stream
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  RespDecoder    │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ StorageEngine   │──> ReplicaRegistry (leader writes)
//! └─────────────────┘
//! ```

pub mod error;
pub mod handler;

pub use error::CommandError;
pub use handler::{CommandHandler, Reply};
