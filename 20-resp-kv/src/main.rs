use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use resp_kv::{
    cli::{Cli, Config},
    db::Db,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from(Cli::parse());
    // Replay finishes before the listener exists, so no client sees a partial key space.
    let db = Arc::new(Db::open(&config.aof_path, config.fsync_interval).await?);

    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    let server = Server::new(listener, Arc::clone(&db));
    info!("listening on {}", server.local_addr()?);

    let served = server.run_until_ctrl_c().await;
    if let Err(err) = &served {
        warn!("server exited with error: {err:?}");
    }

    db.close().await.context("failed to close append-only file")?;
    info!("append-only file closed");
    served
}
