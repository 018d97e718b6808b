//! Replica handshake state machine.
//!
//! Pure state transitions, no I/O: the session feeds decoded leader messages
//! in and writes whatever the machine asks it to send.
//!
//! ```text
//!  Connecting ──PING──> AwaitPong ──+PONG / REPLCONF x2──> AwaitReplconfAcks(2)
//!                                                             │ +OK, +OK / PSYNC ? -1
//!                                                             ▼
//!  Streaming <──snapshot loaded── AwaitFullResync <───────────┘
//! ```
//!
//! Anything unexpected is ignored and the state does not move.

use crate::protocol::RespValue;

/// Where a leader connection stands in the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Connecting,
    AwaitPong,
    AwaitReplconfAcks { pending: u8 },
    /// `header` is set once `+FULLRESYNC` arrived and the payload is due
    AwaitFullResync { header: Option<FullResync> },
    Streaming,
}

/// Parsed `+FULLRESYNC <replid> <offset>` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullResync {
    pub replication_id: String,
    pub offset: u64,
}

/// What the session should do after feeding a message in.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Write these messages to the leader
    Send(Vec<RespValue>),
    /// Record the leader's id and offset, then read the snapshot payload
    ReadSnapshot(FullResync),
    /// Message didn't fit the current state
    Ignore,
}

#[derive(Debug)]
pub struct Handshake {
    state: HandshakeState,
    listening_port: u16,
}

impl Handshake {
    pub fn new(listening_port: u16) -> Self {
        Self {
            state: HandshakeState::Connecting,
            listening_port,
        }
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.state == HandshakeState::Streaming
    }

    /// True between `+FULLRESYNC` and the end of the snapshot payload.
    pub fn awaiting_snapshot(&self) -> bool {
        matches!(
            self.state,
            HandshakeState::AwaitFullResync { header: Some(_) }
        )
    }

    /// The connection is up: greet the leader.
    pub fn on_connected(&mut self) -> Vec<RespValue> {
        self.state = HandshakeState::AwaitPong;
        vec![RespValue::command(["PING"])]
    }

    pub fn on_message(&mut self, message: &RespValue) -> Step {
        match self.state {
            HandshakeState::AwaitPong if is_simple(message, "PONG") => {
                self.state = HandshakeState::AwaitReplconfAcks { pending: 2 };
                let port = self.listening_port.to_string();
                Step::Send(vec![
                    RespValue::command(["REPLCONF".to_string(), "listening-port".to_string(), port]),
                    RespValue::command(["REPLCONF", "capa", "psync2"]),
                ])
            }
            HandshakeState::AwaitReplconfAcks { pending } if is_simple(message, "OK") => {
                if pending > 1 {
                    self.state = HandshakeState::AwaitReplconfAcks {
                        pending: pending - 1,
                    };
                    Step::Send(Vec::new())
                } else {
                    self.state = HandshakeState::AwaitFullResync { header: None };
                    Step::Send(vec![RespValue::command(["PSYNC", "?", "-1"])])
                }
            }
            HandshakeState::AwaitFullResync { header: None } => match parse_fullresync(message) {
                Some(header) => {
                    self.state = HandshakeState::AwaitFullResync {
                        header: Some(header.clone()),
                    };
                    Step::ReadSnapshot(header)
                }
                None => Step::Ignore,
            },
            _ => Step::Ignore,
        }
    }

    /// The snapshot payload has been consumed; propagated writes follow.
    pub fn on_snapshot_loaded(&mut self) {
        if self.awaiting_snapshot() {
            self.state = HandshakeState::Streaming;
        }
    }
}

fn is_simple(message: &RespValue, expected: &str) -> bool {
    matches!(message, RespValue::SimpleString(s) if s.eq_ignore_ascii_case(expected))
}

fn parse_fullresync(message: &RespValue) -> Option<FullResync> {
    let RespValue::SimpleString(line) = message else {
        return None;
    };
    let mut parts = line.split_whitespace();
    if !parts.next()?.eq_ignore_ascii_case("FULLRESYNC") {
        return None;
    }
    let replication_id = parts.next()?.to_string();
    let offset = parts.next()?.parse().ok()?;
    Some(FullResync {
        replication_id,
        offset,
    })
}
