use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Local};
use tokio::sync::{Mutex, Notify, mpsc};

use crate::error::RelayError;

/// Stable identifier of one accepted connection. Never reused while the
/// process lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn from_raw(raw: u64) -> Self {
        ConnectionId(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a payload could not be queued for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The peer's queue is full: it is not keeping up.
    Lagging,
    /// The peer's writer task has already stopped.
    Closed,
}

/// The cheap, clonable part of a connection that fan-out works with.
///
/// Holding a handle never keeps the peer registered; it only keeps the
/// write side of its transport open until the handle is dropped.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    failure: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, addr: SocketAddr, outbound: mpsc::Sender<Bytes>, failure: Arc<Notify>) -> Self {
        ConnectionHandle {
            id,
            addr,
            outbound,
            failure,
        }
    }

    /// Queue `payload` for this peer without waiting.
    pub fn try_deliver(&self, payload: Bytes) -> Result<(), DeliveryError> {
        self.outbound.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Lagging,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Tell the owning session that this peer must be dropped.
    pub fn signal_failure(&self) {
        self.failure.notify_one();
    }
}

/// One live peer, owned by the registry from `register` until `unregister`.
#[derive(Debug)]
pub struct ClientConnection {
    handle: ConnectionHandle,
    connected_at: DateTime<Local>,
}

impl ClientConnection {
    pub fn new(handle: ConnectionHandle) -> Self {
        ClientConnection {
            handle,
            connected_at: Local::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.handle.addr
    }

    pub fn connected_at(&self) -> DateTime<Local> {
        self.connected_at
    }
}

struct Inner {
    connections: Mutex<HashMap<ConnectionId, ClientConnection>>,
    capacity: usize,
    next_id: AtomicU64,
}

/// Who is connected right now. Clones share the same map.
///
/// Every operation takes the same mutex, so the capacity check in
/// `register` and the insertion are one step.
#[derive(Clone)]
pub struct ClientRegistry {
    inner: Arc<Inner>,
}

impl ClientRegistry {
    pub fn new(capacity: usize) -> Self {
        ClientRegistry {
            inner: Arc::new(Inner {
                connections: Mutex::new(HashMap::new()),
                capacity,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Hand out a fresh id for a connection about to be registered.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Insert `connection`; refuses when full or when the id is already present.
    pub async fn register(&self, connection: ClientConnection) -> Result<ConnectionId, RelayError> {
        let mut map = self.inner.connections.lock().await;
        if map.len() >= self.inner.capacity {
            return Err(RelayError::CapacityExceeded {
                limit: self.inner.capacity,
            });
        }
        let id = connection.id();
        if map.contains_key(&id) {
            return Err(RelayError::DuplicateConnection(id));
        }
        map.insert(id, connection);
        Ok(id)
    }

    /// Remove `id`. Returns the owned entry the first time, `None` after.
    pub async fn unregister(&self, id: ConnectionId) -> Option<ClientConnection> {
        self.inner.connections.lock().await.remove(&id)
    }

    /// Point-in-time copy of all handles; the lock is released on return.
    pub async fn snapshot(&self) -> Vec<ConnectionHandle> {
        let map = self.inner.connections.lock().await;
        map.values().map(|c| c.handle.clone()).collect()
    }

    pub async fn size(&self) -> usize {
        self.inner.connections.lock().await.len()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.inner.connections.lock().await.contains_key(&id)
    }

    /// Drop every entry; used once at shutdown.
    pub async fn clear(&self) -> usize {
        let mut map = self.inner.connections.lock().await;
        let n = map.len();
        map.clear();
        n
    }
}
