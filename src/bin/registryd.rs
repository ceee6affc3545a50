//! The registry process entrypoint (spec §3 "Registry", §6). Grounded on
//! `services/server/src/main.rs`'s `#[tokio::main]` startup-then-block
//! shape, swapped from serving `axum` routes to binding a `RegistryServer`.

use clap::Parser;
use comlink::app::shutdown_signal;
use comlink::config::Cli;
use comlink::registry::RegistryServer;
use tracing::info;

#[tokio::main]
async fn main() {
    comlink::init_tracing();

    let cli = Cli::parse();
    if let Err(e) = cli.check_supported() {
        eprintln!("{e}");
        std::process::exit(1);
    }

    let server = match RegistryServer::bind(&cli.ip, cli.registry_port).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "registry failed to bind");
            std::process::exit(1);
        }
    };
    info!(addr = %server.local_addr(), "registry listening");

    shutdown_signal().await;
    info!("registry shutting down");
    server.shutdown().await;
    info!("registry shut down gracefully");
}
