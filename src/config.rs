//! CLI surface shared by every node (spec §6). Grounded on
//! `services/streamer/src/main.rs`'s use of `clap` for its process
//! entrypoint, expressed with `clap::Parser` per the derive style noted for
//! this crate's config layer; config-file/dump/replay are non-goals (spec
//! §9 "Open questions") and are accepted as flags so parsing stays total,
//! but return `Error::Unsupported` if acted on.

use crate::error::Error;
use clap::Parser;

/// Flags shared by every comlink node (spec §6 "CLI surface").
#[derive(Debug, Parser)]
#[command(name = "comlink", version, about = "comlink node")]
pub struct Cli {
    /// Name this node registers under with the registry.
    #[arg(short = 'N', long = "registry-name")]
    pub registry_name: Option<String>,

    /// Registry host to connect to.
    #[arg(short = 'A', long = "registry-addr", default_value = "127.0.0.1")]
    pub registry_addr: String,

    /// Registry port to connect to.
    #[arg(short = 'P', long = "registry-port", default_value_t = crate::registry::server::DEFAULT_PORT)]
    pub registry_port: u16,

    /// Local IP to bind listen sockets to.
    #[arg(short = 'I', long = "ip", default_value = "0.0.0.0")]
    pub ip: String,

    /// Directory to write logs to. Unset means stderr only.
    #[arg(short = 'L', long = "log-dir")]
    pub log_dir: Option<String>,

    /// Session name, used to namespace log files and dumps.
    #[arg(short = 's', long = "session")]
    pub session: Option<String>,

    /// Config file path. Accepted for CLI-surface parity; loading it is
    /// not implemented (spec §9).
    #[arg(short = 'C', long = "config")]
    pub config: Option<String>,

    /// Dump traffic to a directory. Accepted for CLI-surface parity; the
    /// replay/dump subsystem is not implemented (spec §9).
    #[arg(short = 'D', long = "dump", num_args = 0..=1, default_missing_value = ".")]
    pub dump: Option<String>,

    /// Replay a prior dump. Accepted for CLI-surface parity; not
    /// implemented (spec §9).
    #[arg(short = 'R', long = "replay")]
    pub replay: Option<String>,

    /// Print resolved configuration and exit.
    #[arg(short = 'p', long = "print", action = clap::ArgAction::SetTrue)]
    pub print: bool,

    /// Run without a registry, resolving nothing.
    #[arg(short = 'a', long = "stand-alone", action = clap::ArgAction::SetTrue)]
    pub stand_alone: bool,
}

impl Cli {
    /// Fails with `Error::Unsupported` if a non-goal flag was set, so a
    /// caller can surface a clean error instead of silently ignoring it.
    pub fn check_supported(&self) -> Result<(), Error> {
        if self.config.is_some() {
            return Err(Error::Unsupported("config-file loading (-C/--config)"));
        }
        if self.dump.is_some() {
            return Err(Error::Unsupported("traffic dump (-D/--dump)"));
        }
        if self.replay.is_some() {
            return Err(Error::Unsupported("traffic replay (-R/--replay)"));
        }
        Ok(())
    }
}
