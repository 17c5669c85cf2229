use std::fmt;

// Reference-counted byte buffer: one payload shared by every peer queue
use bytes::Bytes;

use crate::server::registry::ConnectionId;

/// Literal chunk that makes a peer leave.
pub const LEAVE_COMMAND: &[u8] = b"bye\n";

/// Sent to a peer that arrives while the registry is full, right before closing it.
pub const OVERFLOW_NOTICE: &[u8] = b"connections is too much, please waiting...\n";

/// Where a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Peer(ConnectionId),
    Operator,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Peer(id) => write!(f, "client {}", id),
            Origin::Operator => f.write_str("operator"),
        }
    }
}

/// One inbound chunk, exactly as read. The length is the length of
/// `payload`; nothing relies on a terminator.
#[derive(Debug, Clone)]
pub struct Message {
    origin: Origin,
    payload: Bytes,
}

impl Message {
    pub fn new(origin: Origin, payload: impl Into<Bytes>) -> Self {
        Message {
            origin,
            payload: payload.into(),
        }
    }

    pub fn from_peer(id: ConnectionId, payload: impl Into<Bytes>) -> Self {
        Message::new(Origin::Peer(id), payload)
    }

    pub fn from_operator(payload: impl Into<Bytes>) -> Self {
        Message::new(Origin::Operator, payload)
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Whole-chunk match; `"bye\n"` glued to other bytes is an ordinary message.
pub fn is_leave_command(chunk: &[u8]) -> bool {
    chunk == LEAVE_COMMAND
}
