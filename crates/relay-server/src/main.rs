use anyhow::Context;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use relay_server::{build_state, ReaperConfig, Server, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,relay_server=debug")),
        )
        .init();

    let cfg = ServerConfig::parse();
    let bind: SocketAddr = cfg.bind.parse().context("parse bind addr")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await
        .context("connect database")?;

    let state = build_state(pool, &cfg);
    let reaper_cfg = ReaperConfig {
        interval: Duration::from_secs(cfg.reaper_interval_secs),
        stuck_timeout: Duration::from_secs(cfg.stuck_timeout_secs),
        ..Default::default()
    };

    let server = Server::start(state, bind, reaper_cfg, true)
        .await
        .context("start server")?;
    tracing::info!(addr = %server.addr, "relay server listening");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!(event = "relay.server.shutdown", "shutting down");
    server.shutdown().await
}
