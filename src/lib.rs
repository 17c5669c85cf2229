//! Text broadcast relay: every chunk a peer sends is fanned out to every
//! connected peer and mirrored to the server's stdout.

// Public module for reading and validating server configuration.
pub mod config;

// Public error taxonomy shared by every component.
pub mod error;

// Public module exposing logging utilities for server lifecycle events.
pub mod logger;

// The relay itself: registry, acceptor, sessions, broadcaster, console.
pub mod server;

use std::time::Duration;

pub use config::{LoggerConfig, ServerConfig};
pub use error::RelayError;
pub use logger::{Logger, init_logger};
pub use server::{RelayServer, run_server};

/// Build a Tokio runtime, set up logging and block on the relay until it stops.
///
/// Parameters:
/// - `name`: tags every log line and names the log file.
/// - `config`: host, port, capacity, buffer sizes, timeouts, logging.
///
/// Returns the fatal startup error, if any; `RelayError::exit_code` maps it
/// to the process exit status.
pub fn start_relay_server(name: &str, config: ServerConfig) -> Result<(), RelayError> {
    // Multi-threaded runtime sized by `worker_threads`
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .thread_name("relay-server-worker")
        .enable_all()
        .build()
        .map_err(RelayError::Runtime)?;

    // Create or retrieve a logger instance per the config
    let logger = init_logger(name, &config.logger);

    let result = rt.block_on(async {
        match run_server(config, logger.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                logger.error(&format!("Relay server error: {}", e));
                Err(e)
            }
        }
    });

    // The stdin reader sits on a blocking thread that never returns by itself
    rt.shutdown_timeout(Duration::from_secs(1));
    result
}
