//! Replica side of replication: one session per leader connection, and a
//! background link that reconnects with backoff.
//!
//! A session runs the handshake, loads the snapshot that follows
//! `+FULLRESYNC`, then applies every streamed frame without replying. The
//! snapshot is delimited by its length prefix, so frames that arrive in the
//! same read as the payload are picked up immediately afterwards.

use crate::commands::CommandHandler;
use crate::config::ReplicaOf;
use crate::protocol::{RespDecoder, RespValue};
use crate::replication::handshake::{Handshake, Step};
use crate::replication::ReplicationError;
use crate::snapshot::{self, SnapshotError};
use crate::storage::StorageEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// First reconnect delay
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Reconnect delays double up to this cap
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Delay between attempts to reach the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Backoff {
    current: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            current: INITIAL_BACKOFF,
        }
    }

    /// Returns the delay before the next attempt and doubles the one after.
    ///
    /// An attempt that reached streaming starts the sequence over.
    fn next_delay(&mut self, synced: bool) -> Duration {
        if synced {
            self.current = INITIAL_BACKOFF;
        }
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }
}

/// One connection to the leader, from `PING` to the end of the stream.
pub struct ReplicaSession<S> {
    stream: S,
    decoder: RespDecoder,
    handshake: Handshake,
    handler: CommandHandler,
    storage: Arc<StorageEngine>,
}

impl<S> ReplicaSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        handler: CommandHandler,
        storage: Arc<StorageEngine>,
        listening_port: u16,
    ) -> Self {
        Self {
            stream,
            decoder: RespDecoder::new(),
            handshake: Handshake::new(listening_port),
            handler,
            storage,
        }
    }

    /// True once the snapshot was loaded and writes are streaming.
    pub fn is_streaming(&self) -> bool {
        self.handshake.is_streaming()
    }

    /// Runs until the leader closes the connection or an I/O error occurs.
    pub async fn run(&mut self) -> Result<(), ReplicationError> {
        let greeting = self.handshake.on_connected();
        self.send(&greeting).await?;

        loop {
            while self.process_buffered().await? {}

            let n = self.stream.read_buf(self.decoder.buffer_mut()).await?;
            if n == 0 {
                return Err(ReplicationError::LeaderClosed);
            }
            trace!(bytes = n, "Read from leader");
        }
    }

    /// Handles one buffered unit of input. Returns false when more bytes are needed.
    async fn process_buffered(&mut self) -> Result<bool, ReplicationError> {
        if self.handshake.is_streaming() {
            let Some((frame, len)) = self.decoder.next_frame() else {
                return Ok(false);
            };
            self.apply(frame, len);
            return Ok(true);
        }

        if self.handshake.awaiting_snapshot() {
            let Some(payload) = self.decoder.decode_raw_payload() else {
                return Ok(false);
            };
            self.load_snapshot(&payload);
            self.handshake.on_snapshot_loaded();
            info!(
                offset = self.storage.replication_offset(),
                "Full resync complete, streaming from leader"
            );
            return Ok(true);
        }

        let Some(message) = self.decoder.decode() else {
            return Ok(false);
        };
        match self.handshake.on_message(&message) {
            Step::Send(replies) => self.send(&replies).await?,
            Step::ReadSnapshot(header) => {
                info!(
                    replication_id = %header.replication_id,
                    offset = header.offset,
                    "Leader accepted full resync"
                );
                self.storage
                    .set_replication_meta(&header.replication_id, header.offset);
            }
            Step::Ignore => {
                debug!(message = %message, state = ?self.handshake.state(), "Ignoring unexpected leader message");
            }
        }
        Ok(true)
    }

    fn apply(&self, frame: RespValue, len: usize) {
        trace!(frame = %frame, bytes = len, "Applying replicated frame");
        if let Err(e) = self.handler.apply_replicated(frame) {
            warn!(error = %e, "Replicated command failed");
        }
        if let Err(e) = self.storage.advance_replication_offset(len) {
            warn!(error = %e, "Failed to advance replication offset");
        }
    }

    fn load_snapshot(&self, payload: &[u8]) {
        match snapshot::load(payload, &self.storage) {
            Ok(report) => info!(
                loaded = report.loaded,
                skipped_expired = report.skipped_expired,
                bytes = payload.len(),
                "Loaded snapshot from leader"
            ),
            Err(SnapshotError::MissingDatabase) => {
                debug!(bytes = payload.len(), "Leader snapshot holds no data")
            }
            Err(e) => warn!(error = %e, "Leader snapshot partially loaded"),
        }
    }

    async fn send(&mut self, messages: &[RespValue]) -> Result<(), ReplicationError> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for message in messages {
            message.serialize_into(&mut buf);
        }
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Handle to the background task following a leader.
///
/// Dropping the handle stops the task.
#[derive(Debug)]
pub struct ReplicaLink {
    shutdown_tx: watch::Sender<bool>,
}

impl ReplicaLink {
    pub fn start(
        leader: ReplicaOf,
        handler: CommandHandler,
        storage: Arc<StorageEngine>,
        listening_port: u16,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(link_loop(leader, handler, storage, listening_port, shutdown_rx));
        Self { shutdown_tx }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for ReplicaLink {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn link_loop(
    leader: ReplicaOf,
    handler: CommandHandler,
    storage: Arc<StorageEngine>,
    listening_port: u16,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new();

    loop {
        let mut synced = false;
        let attempt = follow(&leader, &handler, &storage, listening_port, &mut synced);

        tokio::select! {
            result = attempt => {
                if let Err(e) = result {
                    warn!(leader = %leader, error = %e, "Lost connection to leader");
                }
            }
            _ = shutdown_rx.changed() => {
                info!(leader = %leader, "Replica link stopped");
                return;
            }
        }

        let delay = backoff.next_delay(synced);
        debug!(delay_ms = delay.as_millis() as u64, "Reconnecting to leader");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => return,
        }
    }
}

async fn follow(
    leader: &ReplicaOf,
    handler: &CommandHandler,
    storage: &Arc<StorageEngine>,
    listening_port: u16,
    synced: &mut bool,
) -> Result<(), ReplicationError> {
    let stream = TcpStream::connect(leader.address()).await?;
    stream.set_nodelay(true)?;
    info!(leader = %leader, "Connected to leader");

    let mut session =
        ReplicaSession::new(stream, handler.clone(), Arc::clone(storage), listening_port);
    let result = session.run().await;
    *synced = session.is_streaming();
    result
}
