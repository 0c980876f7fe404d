//! A node that echoes every message back to its sender
//!
//! Point `HIDDENWIRE_PROXY_ADDRESS` at a running Tor SOCKS port and publish
//! `HIDDENWIRE_LISTEN_ADDRESS` as a hidden service, then run:
//! ```bash
//! cargo run --example echo_node -- [config.toml] [identity.key]
//! ```

use hiddenwire_core::core_net::metrics::init_metrics;
use hiddenwire_core::logging::{init_logging_with_config, LogConfig};
use hiddenwire_core::{Config, ConnectionManager, CryptoIdentity, ManagerEvent};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => Config::from_file(&path)?,
        None => Config::from_env()?,
    };
    let key_path = args.next().unwrap_or_else(|| "identity.key".to_string());

    init_logging_with_config(LogConfig::from_config(&config.logging)?)?;
    init_metrics();

    let identity = Arc::new(CryptoIdentity::load_or_generate(&key_path)?);
    let (manager, mut events) = ConnectionManager::start(config, identity)?;
    info!(address = %manager.identifier(), listen = %manager.local_addr(), "Echo node ready");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(ManagerEvent::MessageReceived { from, payload }) => {
                    info!(peer = %from.short(), bytes = payload.len(), "Echoing");
                    if let Err(e) = manager.send(&from, payload, None) {
                        warn!(error = %e, "Echo failed");
                    }
                }
                Some(event) => info!(?event, "Event"),
                None => break,
            },
        }
    }

    manager.stop().await;
    Ok(())
}
