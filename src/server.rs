//! Server assembly and the accept loop.
//!
//! [`Server::bind`] builds one node: it loads the snapshot, picks the
//! replication role, starts the expiry sweeper (and the replica link when
//! following a leader) and binds the listener. [`Server::run_until`] then
//! accepts clients until the shutdown future resolves.

use crate::commands::CommandHandler;
use crate::config::Config;
use crate::connection::handle_connection;
use crate::replication::{self, ReplicaLink, ReplicaRegistry, ReplicationRole};
use crate::snapshot;
use crate::storage::{ExpirySweeper, StorageEngine, SweepConfig};
use anyhow::{Context, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// A bound, fully initialised node.
pub struct Server {
    listener: TcpListener,
    storage: Arc<StorageEngine>,
    handler: CommandHandler,
    _sweeper: ExpirySweeper,
    _link: Option<ReplicaLink>,
}

impl Server {
    pub async fn bind(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let storage = Arc::new(StorageEngine::new());

        let path = config.snapshot_path();
        let snapshot = match snapshot::load_file(&path, &storage) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not read snapshot, starting empty");
                None
            }
        };

        let role = match &config.replicaof {
            None => {
                replication::bootstrap_leader(&storage);
                ReplicationRole::Leader(Arc::new(ReplicaRegistry::new(snapshot)))
            }
            Some(leader) => {
                info!(leader = %leader, "Starting as replica");
                ReplicationRole::Replica(leader.clone())
            }
        };

        let listener = TcpListener::bind(config.bind_address())
            .await
            .with_context(|| format!("failed to bind {}", config.bind_address()))?;
        let local_addr = listener.local_addr()?;

        let handler = CommandHandler::new(Arc::clone(&storage), Arc::clone(&config), role);
        let sweeper = ExpirySweeper::start(Arc::clone(&storage), SweepConfig::default());
        let link = match handler.role() {
            ReplicationRole::Replica(leader) => Some(ReplicaLink::start(
                leader.clone(),
                handler.clone(),
                Arc::clone(&storage),
                local_addr.port(),
            )),
            ReplicationRole::Leader(_) => None,
        };

        info!(addr = %local_addr, "Listening");

        Ok(Self {
            listener,
            storage,
            handler,
            _sweeper: sweeper,
            _link: link,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn storage(&self) -> Arc<StorageEngine> {
        Arc::clone(&self.storage)
    }

    /// The replica registry when this node is a leader.
    pub fn registry(&self) -> Option<Arc<ReplicaRegistry>> {
        match self.handler.role() {
            ReplicationRole::Leader(registry) => Some(Arc::clone(registry)),
            ReplicationRole::Replica(_) => None,
        }
    }

    /// Accepts connections until `shutdown` resolves, then closes every
    /// open connection, replica links included.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(open = connections.len(), "Shutdown signal received, stopping server...");
                    break;
                }
                accepted = self.listener.accept() => self.handle_accept(accepted, &mut connections),
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        connections.shutdown().await;
        info!("Server shutdown complete");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    fn handle_accept(
        &self,
        accepted: std::io::Result<(TcpStream, SocketAddr)>,
        connections: &mut JoinSet<()>,
    ) {
        match accepted {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
                }
                connections.spawn(handle_connection(stream, addr, self.handler.clone()));
            }
            Err(e) => warn!(error = %e, "Failed to accept connection"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    fn ephemeral() -> Config {
        Config {
            port: 0,
            dir: std::env::temp_dir().display().to_string(),
            dbfilename: "relaykv-server-test-missing.rdb".to_string(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_leader_bootstraps_replication_meta() {
        let server = Server::bind(ephemeral()).await.unwrap();
        let storage = server.storage();

        assert_eq!(storage.replication_id().map(|id| id.len()), Some(40));
        assert_eq!(storage.replication_offset(), 0);
        assert!(server.registry().is_some());
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let server = Server::bind(ephemeral()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async {
            let _ = rx.await;
        }));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"*1\r\n$4\r\nPING\r\n").await.unwrap();
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"+PONG\r\n");

        tx.send(()).unwrap();
        task.await.unwrap().unwrap();

        // Open connections are closed on shutdown.
        let n = tokio::time::timeout(std::time::Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }
}
