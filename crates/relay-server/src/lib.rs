//! Relay dispatch server.
//!
//! Hosts the worker control plane (SSE stream + claim/release endpoints),
//! the in-memory worker registry, the push dispatcher, the reaper, and the
//! external-protocol executor. The server owns no business state of its
//! own: everything durable lives behind the queue's store, and everything
//! ephemeral lives in the registry.
//!
//! Construction order is store -> queue -> registry -> dispatcher ->
//! courier -> server, all built once at startup and shared through one
//! [`AppState`]; shutdown signals the background loops, stops accepting
//! connections, and joins everything with a bounded wait.

use anyhow::Context;
use axum::routing::{get, post, put};
use axum::Router;
use sqlx::PgPool;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};

use relay_courier::{Courier, CourierConfig, HttpMailer, Mailer};
use relay_queue::TaskQueue;

pub mod a2a;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod reaper;
pub mod registry;
pub mod routes;
pub mod sse;

pub use a2a::{A2aConfig, A2aExecutor};
pub use config::ServerConfig;
pub use dispatch::Dispatcher;
pub use reaper::ReaperConfig;
pub use registry::WorkerRegistry;

pub struct AppState {
    pub queue: TaskQueue,
    pub registry: Arc<WorkerRegistry>,
    pub dispatcher: Dispatcher,
    pub courier: Arc<Courier>,
    pub auth: auth::AuthTokens,
    pub lease_duration_secs: i64,
    pub sse_heartbeat: Duration,
}

/// Build shared state in dependency order.
pub fn build_state(pool: PgPool, cfg: &ServerConfig) -> Arc<AppState> {
    let queue = TaskQueue::new(pool);
    let registry = Arc::new(WorkerRegistry::new());
    let dispatcher = Dispatcher::new(registry.clone());

    let mailer: Arc<dyn Mailer> = Arc::new(HttpMailer::new(
        cfg.mail_api_url.clone(),
        cfg.mail_api_key.clone(),
        cfg.mail_from_email.clone(),
        Duration::from_secs(cfg.notification_send_timeout_secs),
    ));
    let courier = Arc::new(Courier::new(
        queue.store().clone(),
        CourierConfig {
            notification_max_attempts: cfg.notification_max_attempts,
            send_timeout: Duration::from_secs(cfg.notification_send_timeout_secs),
            ..Default::default()
        },
        mailer,
    ));

    Arc::new(AppState {
        queue,
        registry,
        dispatcher,
        courier,
        auth: auth::AuthTokens::parse(&cfg.auth_tokens),
        lease_duration_secs: cfg.lease_duration_secs,
        sse_heartbeat: Duration::from_secs(cfg.sse_heartbeat_secs),
    })
}

pub fn a2a_executor(state: &AppState, cfg: A2aConfig) -> A2aExecutor {
    A2aExecutor::new(state.queue.clone(), state.dispatcher.clone(), cfg)
}

pub fn a2a_config(cfg: &ServerConfig) -> A2aConfig {
    A2aConfig {
        default_model: cfg.default_model.clone(),
        max_attempts: cfg.task_max_attempts,
        poll_interval: Duration::from_secs_f64(cfg.a2a_poll_interval_secs.max(0.05)),
        max_poll_duration: Duration::from_secs(cfg.a2a_max_poll_secs),
        renotify_interval: Duration::from_secs(cfg.a2a_renotify_secs),
        ..Default::default()
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/worker/tasks/stream", get(sse::worker_task_stream))
        .route("/v1/worker/tasks/claim", post(routes::claim_task))
        .route("/v1/worker/tasks/release", post(routes::release_task))
        .route("/v1/worker/codebases", put(routes::update_codebases))
        .route("/v1/worker/connected", get(routes::list_connected))
        .route("/v1/worker/connected/:worker_id", get(routes::get_connected))
        .with_state(state)
}

#[derive(Debug)]
pub struct Server {
    pub addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl Server {
    pub async fn start(
        state: Arc<AppState>,
        bind: SocketAddr,
        reaper_cfg: ReaperConfig,
        enable_reaper: bool,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind server to {bind}"))?;
        let addr = listener.local_addr().context("server local_addr")?;

        let app = build_router(state.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run_server(
            listener,
            app,
            state,
            reaper_cfg,
            shutdown_tx.clone(),
            shutdown_rx,
            enable_reaper,
        ));

        Ok(Self {
            addr,
            shutdown_tx,
            join,
        })
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.join.await.context("join server task")??;
        Ok(())
    }
}

async fn run_server(
    listener: TcpListener,
    app: Router,
    state: Arc<AppState>,
    reaper_cfg: ReaperConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    enable_reaper: bool,
) -> anyhow::Result<()> {
    let mut bg = Vec::<JoinHandle<anyhow::Result<()>>>::new();
    if enable_reaper {
        bg.push(tokio::spawn(reaper::reaper_loop(
            state,
            reaper_cfg,
            shutdown_rx.clone(),
        )));
    }

    let mut server_shutdown = shutdown_rx.clone();
    let server =
        axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
            while !*server_shutdown.borrow() {
                if server_shutdown.changed().await.is_err() {
                    break;
                }
            }
        });

    // Background loops must stop whenever the server ends, error paths included.
    let server_res = server.await;
    let _ = shutdown_tx.send(true);

    for handle in bg {
        let _ = handle.await;
    }

    server_res.context("serve worker control plane")?;
    Ok(())
}
