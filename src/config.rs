//! Server configuration, parsed from the command line.

use clap::Parser;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Command-line configuration for a relaykv node.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "In-memory RESP key-value store with replication", long_about = None)]
pub struct Config {
    /// Host to bind to
    #[arg(long, default_value = crate::DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = crate::DEFAULT_PORT)]
    pub port: u16,

    /// Directory holding the snapshot file
    #[arg(long, default_value = ".")]
    pub dir: String,

    /// Snapshot file name inside `dir`
    #[arg(long, default_value = "dump.rdb")]
    pub dbfilename: String,

    /// Run as a replica of the leader at "<host> <port>"
    #[arg(long, value_name = "HOST PORT")]
    pub replicaof: Option<ReplicaOf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            dir: ".".to_string(),
            dbfilename: "dump.rdb".to_string(),
            replicaof: None,
        }
    }
}

impl Config {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `dir/dbfilename`
    pub fn snapshot_path(&self) -> PathBuf {
        PathBuf::from(&self.dir).join(&self.dbfilename)
    }

    pub fn is_replica(&self) -> bool {
        self.replicaof.is_some()
    }
}

/// Address of the leader a replica follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaOf {
    pub host: String,
    pub port: u16,
}

impl ReplicaOf {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ReplicaOf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ReplicaOfError {
    #[error("expected \"<host> <port>\", got {0:?}")]
    Format(String),

    #[error("invalid leader port {0:?}")]
    Port(String),
}

impl FromStr for ReplicaOf {
    type Err = ReplicaOfError;

    /// Accepts `"host port"`, and `host:port` for convenience.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (host, port) = match trimmed.split_once(char::is_whitespace) {
            Some((host, port)) => (host, port.trim()),
            None => trimmed
                .rsplit_once(':')
                .ok_or_else(|| ReplicaOfError::Format(s.to_string()))?,
        };

        if host.is_empty() {
            return Err(ReplicaOfError::Format(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| ReplicaOfError::Port(port.to_string()))?;

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}
