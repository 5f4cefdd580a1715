//! Standalone Ephemeral Registry host.
//!
//! Configuration comes from the environment:
//! `EASEL_BIND_ADDR`, `EASEL_HEARTBEAT_SECS`, `EASEL_IDLE_TIMEOUT_SECS`,
//! and `RUST_LOG` for log filtering (default `info`).

use easel_collab::registry::{RegistryServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    log::info!(
        "Starting registry on {} (heartbeat {:?}, idle timeout {:?})",
        config.bind_addr,
        config.heartbeat_interval,
        config.idle_timeout
    );

    let server = RegistryServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("Registry server stopped: {e}");
        std::process::exit(1);
    }
}
