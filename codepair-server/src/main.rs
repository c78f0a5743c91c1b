use std::process::ExitCode;

use codepair_collab::{ServerConfig, SyncServer};
use log::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let server = match SyncServer::bind(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };

    match server.local_addr() {
        Ok(addr) => info!(
            "Collaboration endpoint: ws://{addr}{}/{{room}}",
            server.config().normalized_prefix().trim_end_matches('/')
        ),
        Err(e) => error!("Could not read bound address: {e}"),
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
        info!("Ctrl-C received");
    };

    if let Err(e) = server.run_until(shutdown).await {
        error!("Server stopped: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
