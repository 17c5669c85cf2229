use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::server::registry::ConnectionId;

/// Everything that can go wrong inside the relay.
///
/// Only the startup variants are fatal; the rest stay contained in the
/// connection (or the accept iteration) that produced them.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("socket error: {0}")]
    SocketCreate(#[source] io::Error),

    #[error("bind error on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("listen error on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to build Tokio runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("registry is full ({limit} connections)")]
    CapacityExceeded { limit: usize },

    #[error("connection {0} is already registered")]
    DuplicateConnection(ConnectionId),

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("transport error on connection {id}: {source}")]
    Transport {
        id: ConnectionId,
        #[source]
        source: io::Error,
    },
}

impl RelayError {
    /// Process exit status for a fatal error. Non-fatal variants never reach
    /// `main`, but map to 1 so the function stays total.
    pub fn exit_code(&self) -> i32 {
        match self {
            RelayError::SocketCreate(_) => 1,
            RelayError::Bind { .. } => 2,
            RelayError::Listen { .. } => 3,
            RelayError::Runtime(_) => 4,
            RelayError::Config(_) => 5,
            _ => 1,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::SocketCreate(_)
                | RelayError::Bind { .. }
                | RelayError::Listen { .. }
                | RelayError::Runtime(_)
                | RelayError::Config(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_failures_have_distinct_exit_codes() {
        let create = RelayError::SocketCreate(io::Error::other("x"));
        let bind = RelayError::Bind {
            addr: "0.0.0.0:1".into(),
            source: io::Error::other("x"),
        };
        let listen = RelayError::Listen {
            addr: "127.0.0.1:1".parse().unwrap(),
            source: io::Error::other("x"),
        };

        assert_eq!(create.exit_code(), 1);
        assert_eq!(bind.exit_code(), 2);
        assert_eq!(listen.exit_code(), 3);
        assert!(create.is_fatal() && bind.is_fatal() && listen.is_fatal());
    }

    #[test]
    fn per_connection_errors_are_not_fatal() {
        let err = RelayError::Transport {
            id: ConnectionId::from_raw(7),
            source: io::Error::from(io::ErrorKind::BrokenPipe),
        };
        assert!(!err.is_fatal());
        assert!(!RelayError::CapacityExceeded { limit: 2 }.is_fatal());
        assert!(err.to_string().contains("connection 7"));
    }
}
