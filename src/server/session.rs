use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{Notify, broadcast};

use crate::error::RelayError;
use crate::logger::Logger;
use crate::server::broadcaster::Broadcaster;
use crate::server::message::{Message, is_leave_command};
use crate::server::mirror::Mirror;
use crate::server::registry::{ClientRegistry, ConnectionId};

/// Lifecycle of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Leaving,
    Disconnected,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The peer sent the leave command
    Left,
    /// Zero-length read: the peer closed its side
    PeerClosed,
    /// Reading from the peer failed
    TransportError,
    /// The peer's writer task (or the broadcaster) gave up on it
    DeliveryFailed,
    /// The server is shutting down
    Shutdown,
}

impl ExitReason {
    fn state(self) -> SessionState {
        match self {
            ExitReason::Left => SessionState::Leaving,
            _ => SessionState::Disconnected,
        }
    }
}

enum Event {
    Read(std::io::Result<usize>),
    DeliveryFailed,
    Shutdown,
}

/// What every session shares: the registry, the fan-out, the local mirror.
pub struct SessionContext {
    pub registry: ClientRegistry,
    pub broadcaster: Broadcaster,
    /// `None` when peer traffic is not copied to stdout
    pub mirror: Option<Mirror>,
    /// Largest chunk read in one call
    pub buffer_size: usize,
    pub logger: Logger,
}

/// Receive loop and cleanup for one registered peer.
///
/// The session only knows its peer's id; the connection itself belongs to
/// the registry, and the write side to the peer's writer task.
pub struct ClientSession<R> {
    id: ConnectionId,
    addr: SocketAddr,
    reader: R,
    failure: Arc<Notify>,
    shutdown_rx: broadcast::Receiver<()>,
    ctx: Arc<SessionContext>,
    state: SessionState,
}

impl<R> ClientSession<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Build the session for an already-registered connection.
    pub fn new(
        id: ConnectionId,
        addr: SocketAddr,
        reader: R,
        failure: Arc<Notify>,
        shutdown_rx: broadcast::Receiver<()>,
        ctx: Arc<SessionContext>,
    ) -> Self {
        let mut session = ClientSession {
            id,
            addr,
            reader,
            failure,
            shutdown_rx,
            ctx,
            state: SessionState::Connecting,
        };
        // Registration already happened in the acceptor
        session.transition(SessionState::Active);
        session
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        self.ctx.logger.debug(&format!(
            "Client {} session {:?} -> {:?}",
            self.id, self.state, next
        ));
        self.state = next;
    }

    /// Run until leave, disconnect, delivery failure or shutdown, then clean up.
    pub async fn run(mut self) -> ExitReason {
        let mut buf = vec![0u8; self.ctx.buffer_size.max(1)];
        let logger = self.ctx.logger.clone();

        let reason = loop {
            let event = tokio::select! {
                read = self.reader.read(&mut buf) => Event::Read(read),
                _ = self.failure.notified() => Event::DeliveryFailed,
                _ = self.shutdown_rx.recv() => Event::Shutdown,
            };

            match event {
                Event::Read(Ok(0)) => {
                    logger.info(&format!("⚠️ Client {} ({}) disconnected.", self.id, self.addr));
                    break ExitReason::PeerClosed;
                }
                Event::Read(Ok(n)) => {
                    let chunk = &buf[..n];
                    if is_leave_command(chunk) {
                        logger.info(&format!("👋 Client {} ({}) said bye.", self.id, self.addr));
                        break ExitReason::Left;
                    }
                    self.relay(chunk).await;
                }
                Event::Read(Err(source)) => {
                    let err = RelayError::Transport { id: self.id, source };
                    logger.warn(&format!("❌ {}", err));
                    break ExitReason::TransportError;
                }
                Event::DeliveryFailed => {
                    logger.warn(&format!(
                        "❌ Delivery to client {} ({}) failed; closing.",
                        self.id, self.addr
                    ));
                    break ExitReason::DeliveryFailed;
                }
                Event::Shutdown => {
                    logger.warn(&format!("🛑 Client {} disconnected due to shutdown.", self.id));
                    break ExitReason::Shutdown;
                }
            }
        };

        self.transition(reason.state());
        self.close().await;
        reason
    }

    async fn relay(&self, chunk: &[u8]) {
        let payload = Bytes::copy_from_slice(chunk);
        if let Some(mirror) = &self.ctx.mirror {
            mirror.push(payload.clone());
        }
        self.ctx.broadcaster.send_all(Message::from_peer(self.id, payload)).await;
    }

    /// Unregister first, then let the read half drop.
    async fn close(mut self) {
        let registry = &self.ctx.registry;
        match registry.unregister(self.id).await {
            Some(conn) => {
                let lasted = chrono::Local::now().signed_duration_since(conn.connected_at());
                self.ctx.logger.info(&format!(
                    "🧼 Close connection with client {} ({}) after {}s; {} clients remain",
                    self.id,
                    conn.addr(),
                    lasted.num_seconds(),
                    registry.size().await
                ));
            }
            None => {
                self.ctx.logger.debug(&format!("Client {} was already unregistered", self.id));
            }
        }
        self.transition(SessionState::Closed);
    }
}
