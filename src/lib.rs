//! # relaykv - An In-Memory RESP Key-Value Store with Replication
//!
//! relaykv speaks the RESP wire protocol over TCP, can start from a binary
//! snapshot, and replicates writes from one leader to any number of replicas.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              relaykv                                    │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │   Server    │───>│ Connection  │───>│  Command    │──> ReplicaRegistry│
//! │  │ (Listener)  │    │  Handler    │    │  Handler    │    (leader)      │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘                  │
//! │                                               │                         │
//! │  ┌─────────────┐                              ▼                         │
//! │  │ ReplicaLink │──apply_replicated──> ┌──────────────────────────────┐  │
//! │  │ (replica)   │                      │       StorageEngine          │  │
//! │  └─────────────┘                      │  64 shards, lazy expiry      │  │
//! │  ┌─────────────┐                      └──────────────────────────────┘  │
//! │  │  Snapshot   │──── startup load ──────────────▲                       │
//! │  └─────────────┘                                │                       │
//! │                                         ExpirySweeper                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use relaykv::{Config, Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Server::bind(Config::default()).await?;
//!     server.run_until_ctrl_c().await
//! }
//! ```
//!
//! ## Supported Commands
//!
//! - `PING`, `ECHO message`
//! - `SET key value [PX ms | EX s]`, `GET key`, `KEYS *`
//! - `CONFIG GET dir|dbfilename`
//! - `INFO [replication]`
//! - `REPLCONF ...`, `PSYNC ? -1` (replica handshake)
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP types, parser and per-connection decoder
//! - [`storage`]: Sharded store with expiry and the background sweeper
//! - [`snapshot`]: Snapshot file loader
//! - [`commands`]: Command dispatcher
//! - [`replication`]: Leader registry, replica handshake and link
//! - [`connection`]: Per-client connection task
//! - [`server`]: Node assembly and accept loop
//! - [`config`]: Command-line configuration
//!
//! ## Expiry
//!
//! Keys with a TTL are expired in two ways:
//! 1. **Lazy**: every read checks the deadline, so an expired key is never returned
//! 2. **Active**: a background task reclaims keys nobody reads again

pub mod commands;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod replication;
pub mod server;
pub mod snapshot;
pub mod storage;

pub use commands::{CommandError, CommandHandler, Reply};
pub use config::{Config, ReplicaOf};
pub use connection::handle_connection;
pub use protocol::{ParseError, RespDecoder, RespParser, RespValue};
pub use replication::{ReplicaRegistry, ReplicationRole};
pub use server::Server;
pub use storage::{ExpirySweeper, StorageEngine, SweepConfig};

/// The default port relaykv listens on (same as Redis)
pub const DEFAULT_PORT: u16 = 6379;

/// The default host relaykv binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of relaykv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
