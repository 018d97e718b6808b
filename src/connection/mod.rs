//! Connection Handler Module
//!
//! Each accepted client is served by its own async task.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     TCP Listener (server)                   │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │ accept() + spawn task
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnectionHandler                           │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │ Read bytes  │───>│ RespDecoder │───>│ Execute cmd │      │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘      │
//! │                                               ▼             │
//! │                              reply, or replica link mode    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Pipelined commands are answered in order; a command split across reads
//! waits in the decoder until the rest arrives.

pub mod handler;

pub use handler::{handle_connection, ConnectionError, ConnectionHandler};
