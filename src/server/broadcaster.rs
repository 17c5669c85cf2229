use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time;

use crate::logger::Logger;
use crate::server::message::{Message, Origin};
use crate::server::registry::{ClientRegistry, ConnectionId, DeliveryError};

/// Outcome of one `send_all` call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanOut {
    /// Peers whose queue accepted the payload
    pub queued: usize,
    /// Peers that were lagging or already gone; their sessions were signalled
    pub dropped: Vec<ConnectionId>,
}

/// Fans messages out to every registered peer.
///
/// `send_all` never writes to a socket itself. It copies the registry,
/// releases the lock, and pushes the payload into each peer's bounded
/// queue; the per-peer writer tasks do the I/O.
#[derive(Clone)]
pub struct Broadcaster {
    registry: ClientRegistry,
    echo_to_sender: bool,
    logger: Logger,
}

impl Broadcaster {
    pub fn new(registry: ClientRegistry, echo_to_sender: bool, logger: Logger) -> Self {
        Broadcaster {
            registry,
            echo_to_sender,
            logger,
        }
    }

    pub async fn send_all(&self, message: Message) -> FanOut {
        // 1) Snapshot under the registry lock, which is released right here
        let snapshot = self.registry.snapshot().await;

        let mut outcome = FanOut::default();
        for peer in snapshot {
            if !self.echo_to_sender && message.origin() == Origin::Peer(peer.id) {
                continue;
            }

            // 2) Each delivery is independent; one bad peer doesn't stop the loop
            match peer.try_deliver(message.payload().clone()) {
                Ok(()) => outcome.queued += 1,
                Err(DeliveryError::Lagging) => {
                    self.logger.warn(&format!(
                        "🐢 Client {} ({}) is not keeping up; dropping it",
                        peer.id, peer.addr
                    ));
                    peer.signal_failure();
                    outcome.dropped.push(peer.id);
                }
                Err(DeliveryError::Closed) => {
                    // Writer already gave up and signalled; the session is on its way out
                    peer.signal_failure();
                    outcome.dropped.push(peer.id);
                }
            }
        }

        self.logger.debug(&format!(
            "📣 {} bytes from {} queued for {} peer(s)",
            message.len(),
            message.origin(),
            outcome.queued
        ));
        outcome
    }
}

/// Spawn the task that owns a peer's write side.
///
/// Payloads are written in queue order, each bounded by `send_timeout`.
/// On the first failed or timed-out write the task signals `failure` and then
/// only drains the queue, so the write side stays open (unused) until every
/// sender is gone, i.e. until the peer has been unregistered and no snapshot
/// still refers to it.
pub fn spawn_outbound_writer<W>(
    id: ConnectionId,
    mut writer: W,
    mut rx: mpsc::Receiver<Bytes>,
    failure: Arc<Notify>,
    send_timeout: Duration,
    logger: Logger,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(buf) = rx.recv().await {
            let failed = match time::timeout(send_timeout, writer.write_all(&buf)).await {
                Ok(Ok(())) => false,
                Ok(Err(e)) => {
                    logger.warn(&format!("❌ Failed to send to client {}: {}", id, e));
                    true
                }
                Err(_) => {
                    logger.warn(&format!(
                        "⏰ Send to client {} timed out after {:?}",
                        id, send_timeout
                    ));
                    true
                }
            };

            if failed {
                failure.notify_one();
                while rx.recv().await.is_some() {}
                break;
            }
        }

        // All senders are gone: the peer is unregistered. Closing the write side now is safe.
        let _ = writer.shutdown().await;
        logger.debug(&format!("Writer for client {} stopped", id));
    })
}
