//! comlink: messagehub/messagelink WebSocket channels, a topic registry and
//! client-side proxy, and HTTP service endpoints (spec §1, §3).

pub mod addr;
pub mod app;
pub mod config;
pub mod datalink;
pub mod error;
pub mod http;
pub mod proxy;
pub mod registry;
pub mod service;
pub mod streamer;
pub mod ws;

pub use addr::NetAddr;
pub use error::Error;
pub use proxy::Proxy;

/// Initialises `tracing` from `LOG_LEVEL` (default `info`), matching
/// `services/server/src/main.rs`'s startup sequence.
pub fn init_tracing() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(log_level))
        .try_init()
        .ok();
}
