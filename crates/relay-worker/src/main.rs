use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use relay_worker::{WorkerConfig, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,relay_worker=debug")),
        )
        .init();

    let cfg = WorkerConfig::parse();
    let pool = WorkerPool::start(cfg).await.context("start worker pool")?;

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!(event = "relay.worker_main.shutdown", "shutdown signal received");
    pool.stop().await
}
