//! Command Handler Module
//!
//! Interprets one decoded request (an array of bulk strings) against the
//! store. Command names are case-insensitive.
//!
//! ## Supported Commands
//!
//! - `PING` - Test connection
//! - `ECHO message` - Echo message
//! - `SET key value [PX milliseconds | EX seconds]` - Set a key
//! - `GET key` - Get a key's value
//! - `KEYS *` - All live keys in insertion order
//! - `CONFIG GET dir|dbfilename` - Snapshot location
//! - `INFO [replication]` - Replication role and offset
//! - `REPLCONF ...` - Replica handshake, always `+OK`
//! - `PSYNC ? -1` - Full resynchronisation, leader only
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CommandHandler                          │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │  execute()  │───>│  dispatch() │───>│   cmd_*()   │      │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘      │
//! │                                               │             │
//! │                         ┌─────────────────────┴──────┐      │
//! │                         ▼                            ▼      │
//! │                  StorageEngine            ReplicaRegistry   │
//! │                                            (leader only)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes arriving from a client go through [`CommandHandler::execute`];
//! writes streamed from the leader go through
//! [`CommandHandler::apply_replicated`], which skips the read-only check and
//! never propagates.

use crate::commands::CommandError;
use crate::config::Config;
use crate::protocol::RespValue;
use crate::replication::{ReplicaSubscription, ReplicationRole};
use crate::storage::{is_reserved, StorageEngine};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Where a command came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Client,
    Leader,
}

/// The outcome of executing a client command.
#[derive(Debug)]
pub enum Reply {
    /// An ordinary reply
    Value(RespValue),
    /// Reply to `REPLCONF`; the peer is negotiating to become a replica
    ReplicaHandshake(RespValue),
    /// Reply to `PSYNC`: send `line`, then `snapshot` as a raw payload, then
    /// forward everything the subscription yields
    FullResync {
        line: RespValue,
        snapshot: Bytes,
        subscription: ReplicaSubscription,
    },
}

impl From<RespValue> for Reply {
    fn from(value: RespValue) -> Self {
        Reply::Value(value)
    }
}

/// Handles commands by dispatching them to the appropriate handlers.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    storage: Arc<StorageEngine>,
    config: Arc<Config>,
    role: ReplicationRole,
}

impl CommandHandler {
    pub fn new(storage: Arc<StorageEngine>, config: Arc<Config>, role: ReplicationRole) -> Self {
        Self {
            storage,
            config,
            role,
        }
    }

    pub fn role(&self) -> &ReplicationRole {
        &self.role
    }

    /// Executes a client command. Errors come back as RESP error replies.
    pub fn execute(&self, command: RespValue) -> Reply {
        match self.run(command, Origin::Client) {
            Ok(reply) => reply,
            Err(e) => Reply::Value(e.into()),
        }
    }

    /// Applies a command streamed from the leader. No reply is produced.
    pub fn apply_replicated(&self, command: RespValue) -> Result<(), CommandError> {
        self.run(command, Origin::Leader).map(|_| ())
    }

    fn run(&self, command: RespValue, origin: Origin) -> Result<Reply, CommandError> {
        let args = match command {
            RespValue::Array(args) if !args.is_empty() => args,
            _ => return Err(CommandError::InvalidRequest),
        };

        let cmd_name = match &args[0] {
            RespValue::BulkString(s) => std::str::from_utf8(s)
                .map_err(|_| CommandError::UnknownCommand)?
                .to_ascii_uppercase(),
            RespValue::SimpleString(s) => s.to_ascii_uppercase(),
            _ => return Err(CommandError::InvalidRequest),
        };

        trace!(command = %cmd_name, args = args.len() - 1, ?origin, "Dispatching");
        self.dispatch(&cmd_name, &args[1..], origin)
    }

    fn dispatch(&self, cmd: &str, args: &[RespValue], origin: Origin) -> Result<Reply, CommandError> {
        let value = match cmd {
            "PING" => self.cmd_ping(args)?,
            "ECHO" => self.cmd_echo(args)?,
            "SET" => self.cmd_set(args, origin)?,
            "GET" => self.cmd_get(args)?,
            "KEYS" => self.cmd_keys(args)?,
            "CONFIG" => self.cmd_config(args)?,
            "INFO" => self.cmd_info(args)?,
            "REPLCONF" => return Ok(Reply::ReplicaHandshake(RespValue::ok())),
            "PSYNC" => return self.cmd_psync(args),
            _ => return Err(CommandError::UnknownCommand),
        };
        Ok(Reply::Value(value))
    }

    // ========================================================================
    // Helper functions
    // ========================================================================

    fn get_bytes(&self, value: &RespValue) -> Option<Bytes> {
        match value {
            RespValue::BulkString(b) => Some(b.clone()),
            RespValue::SimpleString(s) => Some(Bytes::from(s.clone())),
            _ => None,
        }
    }

    fn get_string(&self, value: &RespValue) -> Option<String> {
        value.as_str().map(|s| s.to_string())
    }

    /// A strictly positive integer argument.
    fn get_positive(&self, value: &RespValue) -> Option<u64> {
        let n: i64 = match value {
            RespValue::Integer(n) => *n,
            other => other.as_str()?.parse().ok()?,
        };
        u64::try_from(n).ok().filter(|n| *n > 0)
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// PING [message]
    fn cmd_ping(&self, args: &[RespValue]) -> Result<RespValue, CommandError> {
        match args {
            [] => Ok(RespValue::pong()),
            [message] => self
                .get_bytes(message)
                .map(RespValue::bulk_string)
                .ok_or_else(|| CommandError::InvalidArguments("ping".into())),
            _ => Err(CommandError::InvalidArguments("ping".into())),
        }
    }

    /// ECHO message
    fn cmd_echo(&self, args: &[RespValue]) -> Result<RespValue, CommandError> {
        match args {
            [message] => self
                .get_bytes(message)
                .map(RespValue::bulk_string)
                .ok_or_else(|| CommandError::InvalidArguments("echo".into())),
            _ => Err(CommandError::InvalidArguments("echo".into())),
        }
    }

    /// SET key value [PX milliseconds | EX seconds]
    fn cmd_set(&self, args: &[RespValue], origin: Origin) -> Result<RespValue, CommandError> {
        let wrong_args = || CommandError::InvalidArguments("set".into());

        if args.len() < 2 {
            return Err(wrong_args());
        }
        let key = self.get_bytes(&args[0]).ok_or_else(wrong_args)?;
        let value = self.get_bytes(&args[1]).ok_or_else(wrong_args)?;

        let mut ttl: Option<Duration> = None;
        let mut options = args[2..].iter();
        while let Some(opt) = options.next() {
            let opt = self
                .get_string(opt)
                .ok_or_else(wrong_args)?
                .to_ascii_uppercase();
            let millis_per_unit: u64 = match opt.as_str() {
                "PX" => 1,
                "EX" => 1000,
                _ => {
                    return Err(CommandError::UnsupportedOperation(format!(
                        "unsupported SET option '{}'",
                        opt
                    )))
                }
            };
            let amount = options.next().ok_or_else(wrong_args)?;
            let millis = self
                .get_positive(amount)
                .and_then(|n| n.checked_mul(millis_per_unit))
                .ok_or(CommandError::InvalidTimeout)?;
            ttl = Some(ttl_from_millis(millis)?);
        }

        match (origin, &self.role) {
            (Origin::Leader, _) => {
                self.storage.set(key, value, ttl);
            }
            (Origin::Client, ReplicationRole::Replica(_)) => return Err(CommandError::ReadOnly),
            (Origin::Client, ReplicationRole::Leader(registry)) => {
                if is_reserved(&key) {
                    return Err(CommandError::UnsupportedOperation(format!(
                        "key '{}' is reserved",
                        String::from_utf8_lossy(&key)
                    )));
                }
                let frame = propagation_frame(&key, &value, ttl);
                registry.commit(&self.storage, frame, || {
                    self.storage.set(key, value, ttl);
                });
            }
        }

        Ok(RespValue::ok())
    }

    /// GET key
    fn cmd_get(&self, args: &[RespValue]) -> Result<RespValue, CommandError> {
        let [key] = args else {
            return Err(CommandError::InvalidArguments("get".into()));
        };
        let key = self
            .get_bytes(key)
            .ok_or_else(|| CommandError::InvalidArguments("get".into()))?;

        Ok(match self.storage.get(&key) {
            Some(value) => RespValue::bulk_string(value),
            None => RespValue::null(),
        })
    }

    /// KEYS pattern
    fn cmd_keys(&self, args: &[RespValue]) -> Result<RespValue, CommandError> {
        let pattern = match args {
            [pattern] => self.get_string(pattern),
            _ => None,
        }
        .ok_or_else(|| CommandError::InvalidArguments("keys".into()))?;

        let keys = self.storage.keys(&pattern)?;
        Ok(RespValue::array(
            keys.into_iter().map(RespValue::bulk_string).collect(),
        ))
    }

    /// CONFIG GET parameter
    fn cmd_config(&self, args: &[RespValue]) -> Result<RespValue, CommandError> {
        let (subcommand, parameter) = match args {
            [sub, param] => (self.get_string(sub), self.get_string(param)),
            _ => return Err(CommandError::InvalidArguments("config".into())),
        };
        let (Some(subcommand), Some(parameter)) = (subcommand, parameter) else {
            return Err(CommandError::InvalidArguments("config".into()));
        };

        if !subcommand.eq_ignore_ascii_case("GET") {
            return Err(CommandError::UnsupportedOperation(format!(
                "unsupported CONFIG subcommand '{}'",
                subcommand
            )));
        }

        let value = match parameter.to_ascii_lowercase().as_str() {
            "dir" => self.config.dir.clone(),
            "dbfilename" => self.config.dbfilename.clone(),
            _ => {
                return Err(CommandError::UnsupportedOperation(format!(
                    "unsupported CONFIG parameter '{}'",
                    parameter
                )))
            }
        };

        Ok(RespValue::array(vec![
            RespValue::bulk_string(parameter),
            RespValue::bulk_string(value),
        ]))
    }

    /// INFO [replication]
    fn cmd_info(&self, args: &[RespValue]) -> Result<RespValue, CommandError> {
        match args {
            [] => {}
            [section] => {
                let section = self.get_string(section).unwrap_or_default();
                if !section.eq_ignore_ascii_case("replication") {
                    return Err(CommandError::UnsupportedOperation(format!(
                        "unsupported INFO section '{}'",
                        section
                    )));
                }
            }
            _ => return Err(CommandError::InvalidArguments("info".into())),
        }

        let lines = match self.role {
            ReplicationRole::Leader(_) => vec![
                "role:master".to_string(),
                format!(
                    "master_replid:{}",
                    self.storage.replication_id().unwrap_or_default()
                ),
                format!("master_repl_offset:{}", self.storage.replication_offset()),
            ],
            ReplicationRole::Replica(_) => vec!["role:slave".to_string()],
        };

        Ok(RespValue::bulk_string(lines.join("\r\n")))
    }

    /// PSYNC replicationid offset
    fn cmd_psync(&self, args: &[RespValue]) -> Result<Reply, CommandError> {
        if args.len() != 2 {
            return Err(CommandError::InvalidArguments("psync".into()));
        }
        let ReplicationRole::Leader(registry) = &self.role else {
            return Err(CommandError::UnsupportedOperation(
                "PSYNC is only served by a leader".into(),
            ));
        };

        let subscription = registry.subscribe(&self.storage);
        let line = RespValue::simple_string(format!(
            "FULLRESYNC {} {}",
            subscription.replication_id, subscription.offset
        ));

        Ok(Reply::FullResync {
            line,
            snapshot: registry.snapshot(),
            subscription,
        })
    }
}

/// Validates a TTL before anything is written.
///
/// The milliseconds must fit in an `i64`, since that is what a replica
/// accepts in the propagated `PX`, and the deadline must be representable.
fn ttl_from_millis(millis: u64) -> Result<Duration, CommandError> {
    if i64::try_from(millis).is_err() {
        return Err(CommandError::InvalidTimeout);
    }
    let ttl = Duration::from_millis(millis);
    Instant::now()
        .checked_add(ttl)
        .ok_or(CommandError::InvalidTimeout)?;
    Ok(ttl)
}

/// The write as replicas receive it: `SET key value [PX ms]`.
fn propagation_frame(key: &Bytes, value: &Bytes, ttl: Option<Duration>) -> Bytes {
    let mut parts = vec![Bytes::from_static(b"SET"), key.clone(), value.clone()];
    if let Some(ttl) = ttl {
        parts.push(Bytes::from_static(b"PX"));
        parts.push(Bytes::from(ttl.as_millis().to_string()));
    }
    Bytes::from(RespValue::command(parts).serialize())
}
