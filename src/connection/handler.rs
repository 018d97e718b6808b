//! Connection Handler Module
//!
//! Each client gets its own task that reads commands and writes replies.
//! A client that sends `PSYNC` turns into a replica link: from then on the
//! task forwards propagated writes to it and ignores what it sends back.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client connects
//!        │
//!        ▼
//! 2. ┌──────────────────────────────┐
//!    │  read ──> decode ──> execute │<──┐
//!    │              │               │   │ Reply::Value / ReplicaHandshake
//!    │              └──> reply ─────┼───┘
//!    └──────────────┬───────────────┘
//!                   │ Reply::FullResync
//!                   ▼
//! 3. ┌──────────────────────────────┐
//!    │  FULLRESYNC + snapshot       │
//!    │  forward propagated writes   │
//!    └──────────────┬───────────────┘
//!                   ▼
//! 4. Disconnect: decoder buffer dropped, replica unregistered
//! ```
//!
//! ## Buffer Management
//!
//! The connection's [`RespDecoder`] lives as long as the connection, so a
//! command split over several reads is reassembled. Bytes that can never form
//! a valid frame are left in place: the connection stalls instead of closing.

use crate::commands::{CommandHandler, Reply};
use crate::protocol::{encode_raw_payload, RespDecoder, RespValue};
use crate::replication::ReplicaSubscription;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// Handles a single client connection.
pub struct ConnectionHandler {
    stream: BufWriter<TcpStream>,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// Inbound bytes not yet decoded
    decoder: RespDecoder,

    command_handler: CommandHandler,
}

/// What woke a replica link up.
enum LinkEvent {
    Propagate(Option<Bytes>),
    Inbound(std::io::Result<usize>),
}

impl ConnectionHandler {
    pub fn new(stream: TcpStream, addr: SocketAddr, command_handler: CommandHandler) -> Self {
        Self {
            stream: BufWriter::new(stream),
            addr,
            decoder: RespDecoder::new(),
            command_handler,
        }
    }

    /// Runs the connection until the client goes away.
    pub async fn run(mut self) -> Result<(), ConnectionError> {
        info!(client = %self.addr, "Client connected");

        let result = self.main_loop().await;

        match &result {
            Ok(()) => info!(client = %self.addr, "Client disconnected gracefully"),
            Err(ConnectionError::ClientDisconnected) => {
                debug!(client = %self.addr, "Client disconnected")
            }
            Err(ConnectionError::Io(io_err))
                if io_err.kind() == std::io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %self.addr, "Connection reset by client")
            }
            Err(e) => warn!(client = %self.addr, error = %e, "Connection error"),
        }

        result
    }

    /// The read-execute-respond loop.
    async fn main_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            while let Some(command) = self.decoder.decode() {
                trace!(client = %self.addr, command = %command, "Decoded command");

                match self.command_handler.execute(command) {
                    Reply::Value(response) => self.send_response(&response).await?,
                    Reply::ReplicaHandshake(response) => {
                        debug!(client = %self.addr, "Peer negotiating replication");
                        self.send_response(&response).await?;
                    }
                    Reply::FullResync {
                        line,
                        snapshot,
                        subscription,
                    } => {
                        self.start_full_resync(&line, &snapshot).await?;
                        return self.serve_replica(subscription).await;
                    }
                }
            }

            self.read_more_data().await?;
        }
    }

    /// Reads more data from the socket into the decoder.
    async fn read_more_data(&mut self) -> Result<(), ConnectionError> {
        let n = self
            .stream
            .get_mut()
            .read_buf(self.decoder.buffer_mut())
            .await?;

        if n == 0 {
            return if self.decoder.is_empty() {
                Err(ConnectionError::ClientDisconnected)
            } else {
                Err(ConnectionError::UnexpectedEof)
            };
        }

        trace!(client = %self.addr, bytes = n, buffered = self.decoder.buffered(), "Read data");
        Ok(())
    }

    async fn send_response(&mut self, response: &RespValue) -> Result<(), ConnectionError> {
        let bytes = response.serialize();
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        trace!(client = %self.addr, bytes = bytes.len(), "Sent response");
        Ok(())
    }

    /// Writes `+FULLRESYNC ...` followed by the unterminated snapshot payload.
    async fn start_full_resync(
        &mut self,
        line: &RespValue,
        snapshot: &[u8],
    ) -> Result<(), ConnectionError> {
        self.stream.write_all(&line.serialize()).await?;
        self.stream.write_all(&encode_raw_payload(snapshot)).await?;
        self.stream.flush().await?;
        info!(client = %self.addr, snapshot_bytes = snapshot.len(), "Sent full resync");
        Ok(())
    }

    /// Forwards propagated writes until either side goes away.
    ///
    /// The subscription unregisters the replica when it is dropped here.
    async fn serve_replica(
        &mut self,
        mut subscription: ReplicaSubscription,
    ) -> Result<(), ConnectionError> {
        self.discard_inbound();

        loop {
            let event = tokio::select! {
                frame = subscription.recv() => LinkEvent::Propagate(frame),
                read = self.stream.get_mut().read_buf(self.decoder.buffer_mut()) => {
                    LinkEvent::Inbound(read)
                }
            };

            match event {
                LinkEvent::Propagate(Some(frame)) => {
                    self.stream.write_all(&frame).await?;
                    self.stream.flush().await?;
                    trace!(client = %self.addr, bytes = frame.len(), "Propagated write");
                }
                LinkEvent::Propagate(None) => return Ok(()),
                LinkEvent::Inbound(Ok(0)) => return Err(ConnectionError::ClientDisconnected),
                LinkEvent::Inbound(Ok(_)) => self.discard_inbound(),
                LinkEvent::Inbound(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Replicas never get replies; anything they send is decoded and dropped.
    fn discard_inbound(&mut self) {
        while let Some(message) = self.decoder.decode() {
            trace!(client = %self.addr, message = %message, "Ignoring message from replica");
        }
    }
}

/// Errors that can occur while handling a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Client disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Client went away with a partial command buffered
    #[error("Unexpected end of stream")]
    UnexpectedEof,
}

/// Creates a [`ConnectionHandler`] and runs it to completion.
pub async fn handle_connection(stream: TcpStream, addr: SocketAddr, command_handler: CommandHandler) {
    let handler = ConnectionHandler::new(stream, addr, command_handler);
    // Outcome already logged by `run`.
    let _ = handler.run().await;
}
