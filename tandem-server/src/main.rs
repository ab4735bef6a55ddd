//! tandem-server: WebSocket sync server for tandem documents.
//!
//! ```text
//! RUST_LOG=info tandem-server [BIND_ADDR]
//! ```
//!
//! `TANDEM_BIND_ADDR` and `TANDEM_BROADCAST_CAPACITY` override the
//! defaults; a positional `BIND_ADDR` overrides both.

use log::{info, warn};
use tandem_collab::server::{ServerConfig, SyncServer};

const BIND_ADDR_VAR: &str = "TANDEM_BIND_ADDR";
const BROADCAST_CAPACITY_VAR: &str = "TANDEM_BROADCAST_CAPACITY";

/// Build the config from the environment lookup and the first argument.
fn load_config<F>(lookup: F, arg: Option<String>) -> ServerConfig
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = ServerConfig::default();

    if let Some(addr) = lookup(BIND_ADDR_VAR) {
        config.bind_addr = addr;
    }
    if let Some(raw) = lookup(BROADCAST_CAPACITY_VAR) {
        match raw.parse::<usize>() {
            Ok(capacity) if capacity > 0 => config.broadcast_capacity = capacity,
            _ => warn!(
                "Ignoring {BROADCAST_CAPACITY_VAR}={raw:?}, using {}",
                config.broadcast_capacity
            ),
        }
    }
    if let Some(addr) = arg {
        config.bind_addr = addr;
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = load_config(|key| std::env::var(key).ok(), std::env::args().nth(1));
    info!(
        "Starting tandem-server on {} (broadcast capacity {}, max {} peers per document)",
        config.bind_addr, config.broadcast_capacity, config.max_peers_per_room
    );

    SyncServer::new(config).run().await
}
