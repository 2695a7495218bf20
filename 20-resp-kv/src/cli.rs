use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:6379")]
    pub listen: SocketAddr,

    /// Append-only file that persists writes and is replayed on startup.
    #[arg(long, default_value = "appendonly.aof")]
    pub aof: PathBuf,

    /// How often the append-only file is fsynced, in milliseconds.
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(1..))]
    pub fsync_interval_ms: u64,
}

/// Settings the server runs with, resolved from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub listen: SocketAddr,
    pub aof_path: PathBuf,
    pub fsync_interval: Duration,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Self {
            listen: cli.listen,
            aof_path: cli.aof,
            fsync_interval: Duration::from_millis(cli.fsync_interval_ms),
        }
    }
}
