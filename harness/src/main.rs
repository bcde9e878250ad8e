use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod config;
mod enqueue;
mod migrate;

#[derive(Parser, Debug)]
#[command(name = "relay-harness")]
#[command(about = "Local harness for the relay dispatch substrate", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run database migrations.
    Migrate,

    /// Run the dispatch server (worker control plane + reaper).
    Server,

    /// Run a hosted worker pool.
    Worker,

    /// Create a task and enqueue a run for it.
    Enqueue {
        /// Task prompt.
        #[arg(long, default_value = "say hello")]
        prompt: String,

        /// Run priority (higher first).
        #[arg(long, default_value_t = 0)]
        priority: i32,

        /// Restrict the run to one agent name.
        #[arg(long)]
        target_agent: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = config::HarnessConfig::from_env().context("load harness config")?;

    match cli.command {
        Command::Migrate => migrate::run(&cfg).await,
        Command::Server => run_server().await,
        Command::Worker => run_worker().await,
        Command::Enqueue {
            prompt,
            priority,
            target_agent,
        } => enqueue::run(&cfg, prompt, priority, target_agent).await,
    }
}

async fn run_server() -> anyhow::Result<()> {
    // Environment-driven, same knobs as the standalone binary.
    let cfg = relay_server::ServerConfig::parse_from(["relay-harness-server"]);
    let bind: SocketAddr = cfg.bind.parse().context("parse bind addr")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.database_url)
        .await
        .context("connect database")?;

    let state = relay_server::build_state(pool, &cfg);
    let reaper_cfg = relay_server::ReaperConfig {
        interval: Duration::from_secs(cfg.reaper_interval_secs),
        stuck_timeout: Duration::from_secs(cfg.stuck_timeout_secs),
        ..Default::default()
    };

    let server = relay_server::Server::start(state, bind, reaper_cfg, true)
        .await
        .context("start server")?;
    tracing::info!(addr = %server.addr, "harness server listening");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    server.shutdown().await
}

async fn run_worker() -> anyhow::Result<()> {
    let cfg = relay_worker::WorkerConfig::parse_from(["relay-harness-worker"]);
    let pool = relay_worker::WorkerPool::start(cfg)
        .await
        .context("start worker pool")?;

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    pool.stop().await
}
