/// === IMPORTS ===

// Standard library types for addresses and I/O errors.
use std::io;
use std::net::SocketAddr;

// Arc is an atomic reference counter for shared ownership across threads/tasks.
use std::sync::Arc;

// Tokio's TCP socket builder (so socket/bind/listen fail separately),
// the listener it turns into, and the accepted stream type.
use tokio::net::{TcpListener, TcpSocket, TcpStream};

// Writing the overflow notice to a rejected peer.
use tokio::io::{AsyncWrite, AsyncWriteExt};

// Asynchronous synchronization and messaging:
// - broadcast: one-to-many channel (used here for shutdown signals).
// - mpsc: bounded per-peer outbound queue.
// - Notify: a peer's writer task telling its session to give up.
use tokio::sync::{Notify, broadcast, mpsc};

// Time tools for the accept backoff and the notice timeout.
use tokio::time;


/// === MODULES ===

pub mod broadcaster;    // snapshot-then-enqueue fan-out + per-peer writer tasks
pub mod console;        // operator stdin -> broadcast
pub mod message;        // Message, Origin and the protocol literals
pub mod mirror;         // single stdout writer for peer traffic
pub mod registry;       // who is connected
pub mod session;        // per-peer receive loop

use crate::config::ServerConfig;
use crate::error::RelayError;
use crate::logger::Logger;

use crate::server::broadcaster::{Broadcaster, spawn_outbound_writer};
use crate::server::console::OperatorConsole;
use crate::server::message::OVERFLOW_NOTICE;
use crate::server::mirror::Mirror;
use crate::server::registry::{ClientConnection, ClientRegistry, ConnectionHandle};
use crate::server::session::{ClientSession, SessionContext};


/// === RELAY SERVER ===

/// A bound listener plus the shared state every task works with.
///
/// `bind` does all the fallible startup work; `serve` then runs the accept
/// loop until the shutdown signal fires.
pub struct RelayServer {
    listener: TcpListener,
    registry: ClientRegistry,
    sessions: Arc<SessionContext>,
    shutdown_tx: broadcast::Sender<()>,
    config: ServerConfig,
    logger: Logger,
}

impl RelayServer {
    /// Resolve, create the socket, bind and listen, each stage with its own error.
    pub async fn bind(config: ServerConfig, logger: Logger) -> Result<Self, RelayError> {
        // Build the "host:port" string and resolve it to a concrete address
        let addr_str = config.listen_address();
        let addr = resolve(&addr_str).await?;

        // 1) Create the socket in the address family of the resolved address
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(RelayError::SocketCreate)?;

        // Quick restarts don't trip over TIME_WAIT
        if let Err(e) = socket.set_reuseaddr(true) {
            logger.warn(&format!("⚠️ Failed to set SO_REUSEADDR: {}", e));
        }

        // 2) Bind
        socket.bind(addr).map_err(|source| RelayError::Bind {
            addr: addr_str.clone(),
            source,
        })?;

        // 3) Listen, with the configured backlog
        let listener = socket
            .listen(config.connection_buffer_size)
            .map_err(|source| RelayError::Listen { addr, source })?;

        let local = listener.local_addr().unwrap_or(addr);
        logger.info(&format!("🚀 Relay server listening on {}", local));

        // The registry starts empty and lives as long as the server
        let registry = ClientRegistry::new(config.max_connections);
        let broadcaster = Broadcaster::new(registry.clone(), config.echo_to_sender, logger.clone());
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        // One task owns stdout for mirrored peer traffic
        let mirror = config.mirror_to_stdout.then(|| {
            let (mirror, _task) =
                Mirror::spawn(tokio::io::stdout(), config.outbound_queue_capacity, logger.clone());
            mirror
        });

        let sessions = Arc::new(SessionContext {
            registry: registry.clone(),
            broadcaster,
            mirror,
            buffer_size: config.buffer_size,
            logger: logger.clone(),
        });

        Ok(RelayServer {
            listener,
            registry,
            sessions,
            shutdown_tx,
            config,
            logger,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> ClientRegistry {
        self.registry.clone()
    }

    pub fn broadcaster(&self) -> Broadcaster {
        self.sessions.broadcaster.clone()
    }

    /// Sending `()` on this stops the acceptor and every session.
    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Accept peers until shutdown.
    pub async fn serve(self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                // 1) New peer arrives
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => self.handle_new_connection(stream, addr).await,
                        // If accept failed (e.g. too many open files), warn and pause briefly
                        Err(e) => {
                            self.logger.warn(&format!("⚠️ {}", RelayError::Accept(e)));
                            time::sleep(self.config.accept_error_backoff()).await;
                        }
                    }
                }

                // 2) A global shutdown signal arrived (e.g. Ctrl+C)
                _ = shutdown_rx.recv() => {
                    self.logger.info("🧹 Server received shutdown signal.");
                    break;
                }
            }
        }

        // Sessions saw the same signal; whatever is left goes now
        let dropped = self.registry.clear().await;
        if dropped > 0 {
            self.logger.info(&format!("🧹 Cleared {} remaining connection(s).", dropped));
        }
    }

    /// Admit or reject one accepted stream
    async fn handle_new_connection(&self, stream: TcpStream, addr: SocketAddr) {
        // Disable Nagle's algorithm: chat-sized chunks go out immediately
        if let Err(e) = stream.set_nodelay(true) {
            self.logger.warn(&format!("⚠️ Failed to set TCP_NODELAY for {}: {}", addr, e));
        }

        // Split the stream: the session reads, the writer task writes
        let (read_half, write_half) = stream.into_split();

        // 1) Cheap pre-check; `register` re-checks under its own lock
        if self.registry.size().await >= self.registry.capacity() {
            self.reject(write_half, addr);
            return;
        }

        // 2) Build the connection value: owned address, fresh id, outbound queue
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_queue_capacity);
        let failure = Arc::new(Notify::new());
        let handle = ConnectionHandle::new(self.registry.next_id(), addr, outbound_tx, failure.clone());

        // 3) Register; only a registered peer gets a session
        let id = match self.registry.register(ClientConnection::new(handle)).await {
            Ok(id) => id,
            Err(RelayError::CapacityExceeded { .. }) => {
                self.reject(write_half, addr);
                return;
            }
            Err(e) => {
                self.logger.error(&format!("Failed to register {}: {}", addr, e));
                return;
            }
        };

        self.logger.info(&format!(
            "🔌 Client {} ({}) connected. Active connections: {}",
            id,
            addr,
            self.registry.size().await
        ));

        // 4) The writer task owns the write half from here on
        spawn_outbound_writer(
            id,
            write_half,
            outbound_rx,
            failure.clone(),
            self.config.send_timeout(),
            self.logger.clone(),
        );

        // 5) Start the session with the owned id
        let session = ClientSession::new(
            id,
            addr,
            read_half,
            failure,
            self.shutdown_tx.subscribe(),
            self.sessions.clone(),
        );
        tokio::spawn(session.run());
    }

    /// Send the overflow notice and close, off the accept loop.
    fn reject<W>(&self, writer: W, addr: SocketAddr)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let err = RelayError::CapacityExceeded {
            limit: self.registry.capacity(),
        };
        self.logger.warn(&format!("🚫 Rejecting {}: {}", addr, err));

        let timeout = self.config.send_timeout();
        let logger = self.logger.clone();
        tokio::spawn(async move {
            if let Err(e) = send_overflow_notice(writer, timeout).await {
                logger.debug(&format!("Overflow notice to {} not delivered: {}", addr, e));
            }
        });
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr, RelayError> {
    let mut addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|source| RelayError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    addrs.next().ok_or_else(|| RelayError::Bind {
        addr: addr.to_string(),
        source: io::Error::new(io::ErrorKind::AddrNotAvailable, "address resolved to nothing"),
    })
}

async fn send_overflow_notice<W>(mut writer: W, timeout: std::time::Duration) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    time::timeout(timeout, async {
        writer.write_all(OVERFLOW_NOTICE).await?;
        writer.shutdown().await
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "overflow notice timed out"))?
}


/// === RUN_SERVER ===

/// This function launches the whole relay:
/// - Binds to the configured host and port
/// - Spawns the Ctrl+C listener and, if enabled, the operator console
/// - Runs the accept loop until shutdown
pub async fn run_server(config: ServerConfig, logger: Logger) -> Result<(), RelayError> {
    logger.debug(&format!(
        "Effective configuration: {}",
        serde_json::to_string(&config).unwrap_or_default()
    ));

    let console_enabled = config.enable_operator_console;
    let buffer_size = config.buffer_size;

    let server = RelayServer::bind(config, logger.clone()).await?;

    // Spawn a task that waits for Ctrl+C, then broadcasts the shutdown signal
    let shutdown_handle = spawn_shutdown_listener(server.shutdown_sender(), logger.clone());

    // Operator input is just another message source, never a registry entry
    let console_handle = console_enabled.then(|| {
        OperatorConsole::new(tokio::io::stdin(), server.broadcaster(), buffer_size, logger.clone()).spawn()
    });

    server.serve().await;

    shutdown_handle.abort();
    if let Some(handle) = console_handle {
        handle.abort();
    }
    Ok(())
}

/// This function spawns a background task that:
/// - Listens for a Ctrl+C signal (SIGINT)
/// - Logs the shutdown event
/// - Broadcasts a shutdown signal to all other tasks using the channel
fn spawn_shutdown_listener(
    shutdown_tx: broadcast::Sender<()>,
    logger: Logger,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            logger.error(&format!("Failed to listen for ctrl_c: {}", e));
            return;
        }
        logger.warn("🛑 Ctrl+C received — shutting down.");
        let _ = shutdown_tx.send(());
    })
}
