//! Ledger Server — hosts board-game ledger rooms over WebSocket.
//!
//! Configuration comes from the environment (see [`ServerConfig::from_env`]);
//! log output is controlled with `RUST_LOG`.

use log::{error, info};

use ledger_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!(
        "Starting Ledger Server on {} (retention {:?}, sweep every {:?})",
        config.bind_addr, config.room.retention, config.sweep_interval
    );

    let server = SyncServer::new(config);
    if let Err(e) = server.run().await {
        error!("Server stopped: {e}");
        std::process::exit(1);
    }
}
