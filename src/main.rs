use std::process;

use relay_server::{ServerConfig, start_relay_server};

/// JSON object with any subset of the `ServerConfig` keys.
const CONFIG_ENV: &str = "RELAY_SERVER_CONFIG";

fn main() {
    let raw = std::env::var(CONFIG_ENV).unwrap_or_default();

    let config = match ServerConfig::from_json_str(&raw) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", CONFIG_ENV, e);
            process::exit(e.exit_code());
        }
    };

    if let Err(e) = start_relay_server("relay_server", config) {
        eprintln!("{}", e);
        process::exit(e.exit_code());
    }
}
