//! Process-wide state: bind IP, quit flag, and the lazily-constructed
//! proxy singleton (spec §6 "Process-wide state", §9 "Global state").
//! Grounded on `services/server/src/main.rs`'s `shutdown_signal` (signal
//! handling) and `services/server/src/state.rs` (one context struct built
//! once at startup and passed explicitly rather than accessed globally).

use crate::addr::NetAddr;
use crate::config::Cli;
use crate::error::Error;
use crate::proxy::Proxy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Constructed once at startup, passed explicitly to every subsystem that
/// needs the bind IP, quit flag, or registry proxy (spec §9 "Global state":
/// "the core must not depend on" a hidden accessor).
pub struct AppContext {
    pub ip: String,
    pub quit: Arc<AtomicBool>,
    pub proxy: Option<Proxy>,
}

impl AppContext {
    pub fn is_quitting(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }
}

/// Builds the process context: connects to the registry proxy unless
/// `--stand-alone` was given (spec §6).
pub async fn app_init(cli: &Cli) -> Result<AppContext, Error> {
    cli.check_supported()?;

    let quit = Arc::new(AtomicBool::new(false));
    let proxy = if cli.stand_alone {
        None
    } else {
        let registry_addr = NetAddr::new(cli.registry_addr.clone(), cli.registry_port);
        Some(Proxy::connect(&registry_addr, quit.clone()).await?)
    };

    Ok(AppContext { ip: cli.ip.clone(), quit, proxy })
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger shutdown.
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[tokio::test]
    async fn stand_alone_skips_proxy_connect() {
        let cli = Cli::parse_from(["comlink", "-a"]);
        let ctx = app_init(&cli).await.unwrap();
        assert!(ctx.proxy.is_none());
        assert!(!ctx.is_quitting());
        ctx.request_quit();
        assert!(ctx.is_quitting());
    }
}
