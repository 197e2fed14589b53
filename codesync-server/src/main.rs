//! CodeSync server — collaborative editing backend over WebSocket.
//!
//! Configuration comes from `CODESYNC_*` environment variables; logging is
//! controlled with `RUST_LOG`.

use log::{error, info};
use std::process::ExitCode;

use codesync_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    info!("Starting CodeSync server...");

    let config = ServerConfig::from_env();
    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open version store: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Server stopped: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
