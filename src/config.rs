// JSON handling: the configuration arrives as one JSON object
use serde_json::Value as JsonValue;

// Lets `extract_or` decode any field type straight out of a JSON value
use serde::de::DeserializeOwned;
use serde::Serialize;

// We need Duration to turn milliseconds into a Rust time value
use std::time::Duration;

// This helper tells us how many CPU cores are available
use num_cpus;

use crate::error::RelayError;

//////////////////////
// LoggerConfig     //
//////////////////////

/// Settings for the fern dispatcher built in `logger::init_logger`
#[derive(Debug, Clone, Serialize)]
pub struct LoggerConfig {
    /// Minimum level as text (`"DEBUG"`, `"INFO"`, ...)
    pub log_level: String,

    /// Print coloured lines to the terminal
    pub enable_console_log: bool,

    /// Append lines to `<log_file_path>/<name>.log`
    pub enable_file_log: bool,

    /// File lines become JSON envelopes instead of plain text
    pub enable_json_log: bool,

    /// Directory for the log file (empty = current directory)
    pub log_file_path: String,

    /// chrono format string for timestamps
    pub date_format: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            log_level: "INFO".to_string(),
            enable_console_log: true,
            enable_file_log: false,
            enable_json_log: false,
            log_file_path: String::new(),
            date_format: "%Y-%m-%d %H:%M:%S%.3f".to_string(),
        }
    }
}

//////////////////////
// ServerConfig     //
//////////////////////

/// All the settings the relay needs
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    /// IP or hostname to listen on (e.g. `"0.0.0.0"`)
    pub host: String,

    /// Port number (e.g. `8888`)
    pub port: u16,

    /// Most peers registered at once; the next one gets the overflow notice
    pub max_connections: usize,

    /// Largest chunk read from a peer (or the operator) in one call
    pub buffer_size: usize,

    /// How many incoming connections the OS buffers before accept (listen backlog)
    pub connection_buffer_size: u32,

    /// Milliseconds a single write to a peer may take before that peer is dropped
    pub send_timeout_ms: u64,

    /// Messages queued per peer before it counts as not keeping up
    pub outbound_queue_capacity: usize,

    /// Milliseconds to sleep after a failed accept
    pub accept_error_backoff_ms: u64,

    /// Whether a peer receives its own messages back
    pub echo_to_sender: bool,

    /// Copy every peer message to the server's stdout
    pub mirror_to_stdout: bool,

    /// Read operator input from stdin and broadcast it
    pub enable_operator_console: bool,

    /// How many Tokio worker threads to spin up (defaults to cpu-1)
    pub worker_threads: usize,

    /// Logging settings
    pub logger: LoggerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 8888,
            max_connections: 10,
            buffer_size: 1024,
            connection_buffer_size: 128,
            send_timeout_ms: 1000,
            outbound_queue_capacity: 256,
            accept_error_backoff_ms: 100,
            echo_to_sender: true,
            mirror_to_stdout: true,
            enable_operator_console: true,
            worker_threads: num_cpus::get().saturating_sub(1).max(1),
            logger: LoggerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// `"host:port"` as handed to the resolver
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn accept_error_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_error_backoff_ms)
    }

    /// Parse a JSON document; an empty string yields the defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, RelayError> {
        if raw.trim().is_empty() {
            return Ok(ServerConfig::default());
        }
        let value: JsonValue =
            serde_json::from_str(raw).map_err(|e| RelayError::Config(e.to_string()))?;
        ServerConfig::try_from(&value)
    }
}

/// Helper: look up `key` in the object, or fall back to `default`.
/// If the value has the wrong type, we warn but still use `default`.
fn extract_or<T: DeserializeOwned>(obj: &serde_json::Map<String, JsonValue>, key: &str, default: T) -> T {
    match obj.get(key) {
        // Key exists; try to convert it to Rust type T
        Some(value) => match serde_json::from_value::<T>(value.clone()) {
            Ok(val) => val,
            Err(err) => {
                eprintln!("Warning: '{}' has wrong type: {}", key, err);
                default
            }
        },
        // Key missing: just use default
        None => default,
    }
}

/////////////////////////////////////////////
// Converting from a JSON object into Rust //
/////////////////////////////////////////////

impl TryFrom<&JsonValue> for LoggerConfig {
    type Error = RelayError;

    fn try_from(value: &JsonValue) -> Result<Self, RelayError> {
        let obj = value
            .as_object()
            .ok_or_else(|| RelayError::Config("'logger' must be an object".to_string()))?;
        let d = LoggerConfig::default();

        Ok(LoggerConfig {
            log_level          : extract_or(obj, "log_level",          d.log_level),
            enable_console_log : extract_or(obj, "enable_console_log", d.enable_console_log),
            enable_file_log    : extract_or(obj, "enable_file_log",    d.enable_file_log),
            enable_json_log    : extract_or(obj, "enable_json_log",    d.enable_json_log),
            log_file_path      : extract_or(obj, "log_file_path",      d.log_file_path),
            date_format        : extract_or(obj, "date_format",        d.date_format),
        })
    }
}

impl TryFrom<&JsonValue> for ServerConfig {
    type Error = RelayError;

    fn try_from(value: &JsonValue) -> Result<Self, RelayError> {
        let obj = value
            .as_object()
            .ok_or_else(|| RelayError::Config("configuration must be a JSON object".to_string()))?;
        let d = ServerConfig::default();

        // Read each setting, supplying the default value
        let host                    = extract_or(obj, "host",                    d.host);
        let port                    = extract_or(obj, "port",                    d.port);
        let max_connections         = extract_or(obj, "max_connections",         d.max_connections);
        let buffer_size             = extract_or(obj, "buffer_size",             d.buffer_size);
        let connection_buffer_size  = extract_or(obj, "connection_buffer_size",  d.connection_buffer_size);
        let send_timeout_ms         = extract_or(obj, "send_timeout_ms",         d.send_timeout_ms);
        let outbound_queue_capacity = extract_or(obj, "outbound_queue_capacity", d.outbound_queue_capacity);
        let accept_error_backoff_ms = extract_or(obj, "accept_error_backoff_ms", d.accept_error_backoff_ms);
        let echo_to_sender          = extract_or(obj, "echo_to_sender",          d.echo_to_sender);
        let mirror_to_stdout        = extract_or(obj, "mirror_to_stdout",        d.mirror_to_stdout);
        let enable_operator_console = extract_or(obj, "enable_operator_console", d.enable_operator_console);
        let worker_threads          = extract_or(obj, "worker_threads",          d.worker_threads);

        // Nested "logger" object, if provided
        let logger = match obj.get("logger") {
            Some(v) => LoggerConfig::try_from(v)?,
            None => d.logger,
        };

        // Zero would make every read return nothing or every peer overflow
        if buffer_size == 0 {
            return Err(RelayError::Config("'buffer_size' must be greater than zero".to_string()));
        }
        if outbound_queue_capacity == 0 {
            return Err(RelayError::Config(
                "'outbound_queue_capacity' must be greater than zero".to_string(),
            ));
        }

        Ok(ServerConfig {
            host,
            port,
            max_connections,
            buffer_size,
            connection_buffer_size,
            send_timeout_ms,
            outbound_queue_capacity,
            accept_error_backoff_ms,
            echo_to_sender,
            mirror_to_stdout,
            enable_operator_console,
            worker_threads: worker_threads.max(1),
            logger,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_input_gives_defaults() {
        let cfg = ServerConfig::from_json_str("  ").unwrap();
        assert_eq!(cfg.port, 8888);
        assert_eq!(cfg.buffer_size, 1024);
        assert_eq!(cfg.max_connections, 10);
        assert!(cfg.echo_to_sender);
    }

    #[test]
    fn wrong_types_fall_back_to_defaults() {
        let cfg = ServerConfig::try_from(&json!({
            "port": "not a port",
            "max_connections": 3,
            "logger": { "log_level": "DEBUG", "enable_console_log": 12 }
        }))
        .unwrap();

        assert_eq!(cfg.port, 8888);
        assert_eq!(cfg.max_connections, 3);
        assert_eq!(cfg.logger.log_level, "DEBUG");
        assert!(cfg.logger.enable_console_log);
    }

    #[test]
    fn malformed_documents_are_rejected() {
        assert!(matches!(
            ServerConfig::from_json_str("{not json"),
            Err(RelayError::Config(_))
        ));
        assert!(matches!(
            ServerConfig::try_from(&json!([1, 2])),
            Err(RelayError::Config(_))
        ));
        assert!(matches!(
            ServerConfig::try_from(&json!({ "buffer_size": 0 })),
            Err(RelayError::Config(_))
        ));
    }

    #[test]
    fn durations_are_derived_from_millis() {
        let cfg = ServerConfig::try_from(&json!({ "send_timeout_ms": 250, "host": "127.0.0.1", "port": 9000 }))
            .unwrap();
        assert_eq!(cfg.send_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.listen_address(), "127.0.0.1:9000");
    }
}
