//! Worker pool lifecycle.
//!
//! One process hosts N concurrent claim loops plus a maintenance tick that
//! reclaims expired leases, refreshes the pool's `workers` row, and retries
//! failed notifications. Shutdown stops new claims, waits a bounded grace
//! period for in-flight runs, and stamps the pool row `stopped` with its
//! aggregate totals.

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use relay_core::WorkerIdentity;
use relay_courier::{Courier, CourierConfig, HttpMailer, Mailer};
use relay_queue::{PoolTotals, Store};

use crate::config::WorkerConfig;
use crate::runtime::HttpAgentRuntime;
use crate::worker::HostedWorker;

pub struct WorkerPool {
    pool_id: String,
    store: Store,
    workers: Vec<Arc<HostedWorker>>,
    worker_handles: Vec<JoinHandle<anyhow::Result<()>>>,
    maintenance: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_grace: Duration,
}

impl WorkerPool {
    pub async fn start(cfg: WorkerConfig) -> anyhow::Result<Self> {
        let connections = (cfg.max_concurrent_tasks * 2).max(4) as u32;
        let pg = PgPoolOptions::new()
            .max_connections(connections)
            .connect(&cfg.database_url)
            .await
            .context("connect database")?;
        let store = Store::new(pg);

        let runtime = Arc::new(HttpAgentRuntime::new(cfg.api_base_url.clone()));
        let mailer: Arc<dyn Mailer> = Arc::new(HttpMailer::new(
            cfg.mail_api_url.clone(),
            cfg.mail_api_key.clone(),
            cfg.mail_from_email.clone(),
            Duration::from_secs(cfg.notification_send_timeout_secs),
        ));
        let courier = Arc::new(Courier::new(
            store.clone(),
            CourierConfig {
                notification_max_attempts: cfg.notification_max_attempts,
                send_timeout: Duration::from_secs(cfg.notification_send_timeout_secs),
                ..Default::default()
            },
            mailer,
        ));

        let hostname = hostname();
        let process_id = std::process::id() as i32;
        let pool_id = format!(
            "{hostname}-{process_id}-{}",
            &Uuid::new_v4().simple().to_string()[..8]
        );

        store
            .register_worker_pool(
                &pool_id,
                &hostname,
                process_id,
                cfg.max_concurrent_tasks as i32,
            )
            .await
            .context("register worker pool")?;

        tracing::info!(
            event = "relay.pool.started",
            pool_id = %pool_id,
            workers = cfg.max_concurrent_tasks,
            agent_name = %cfg.agent_name,
            "worker pool starting"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let capabilities = cfg.capability_list();

        let mut workers = Vec::with_capacity(cfg.max_concurrent_tasks);
        let mut worker_handles = Vec::with_capacity(cfg.max_concurrent_tasks);
        for i in 0..cfg.max_concurrent_tasks {
            let worker = Arc::new(HostedWorker::new(
                WorkerIdentity {
                    worker_id: format!("{pool_id}-worker-{i}"),
                    agent_name: cfg.agent_name.clone(),
                    capabilities: capabilities.clone(),
                },
                store.clone(),
                runtime.clone(),
                courier.clone(),
                Duration::from_secs_f64(cfg.poll_interval_secs.max(0.1)),
                cfg.lease_duration_secs,
                Duration::from_secs(cfg.heartbeat_interval_secs),
            ));
            worker_handles.push(tokio::spawn(worker.clone().run(shutdown_rx.clone())));
            workers.push(worker);
        }

        let maintenance = tokio::spawn(maintenance_loop(
            store.clone(),
            courier,
            pool_id.clone(),
            workers.clone(),
            Duration::from_secs(cfg.reclaim_interval_secs),
            shutdown_rx,
        ));

        Ok(Self {
            pool_id,
            store,
            workers,
            worker_handles,
            maintenance,
            shutdown_tx,
            shutdown_grace: Duration::from_secs(cfg.shutdown_grace_secs),
        })
    }

    /// Stop claiming, wait for in-flight runs up to the grace period, and
    /// mark the pool stopped.
    pub async fn stop(self) -> anyhow::Result<()> {
        tracing::info!(
            event = "relay.pool.stopping",
            pool_id = %self.pool_id,
            "worker pool stopping"
        );
        let _ = self.shutdown_tx.send(true);

        for handle in self.worker_handles {
            match tokio::time::timeout(self.shutdown_grace, handle).await {
                Ok(joined) => {
                    if let Ok(Err(err)) = joined {
                        tracing::warn!(
                            event = "relay.pool.worker_error",
                            error = %err,
                            "worker ended with error"
                        );
                    }
                }
                Err(_) => {
                    tracing::warn!(
                        event = "relay.pool.worker_grace_exceeded",
                        pool_id = %self.pool_id,
                        "worker did not finish within grace period"
                    );
                }
            }
        }
        self.maintenance.abort();

        let totals = PoolTotals {
            tasks_completed: self
                .workers
                .iter()
                .map(|w| w.stats.tasks_completed.load(Ordering::Relaxed))
                .sum(),
            tasks_failed: self
                .workers
                .iter()
                .map(|w| w.stats.tasks_failed.load(Ordering::Relaxed))
                .sum(),
            total_runtime_seconds: self
                .workers
                .iter()
                .map(|w| w.stats.total_runtime_seconds.load(Ordering::Relaxed))
                .sum(),
        };
        self.store
            .stop_worker_pool(&self.pool_id, totals)
            .await
            .context("mark pool stopped")?;

        tracing::info!(
            event = "relay.pool.stopped",
            pool_id = %self.pool_id,
            completed = totals.tasks_completed,
            failed = totals.tasks_failed,
            "worker pool stopped"
        );
        Ok(())
    }
}

async fn maintenance_loop(
    store: Store,
    courier: Arc<Courier>,
    pool_id: String,
    workers: Vec<Arc<HostedWorker>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => {}
        }
        if *shutdown_rx.borrow() {
            return;
        }

        match store.reclaim_expired_task_runs().await {
            Ok(reclaimed) if !reclaimed.is_empty() => {
                tracing::info!(
                    event = "relay.pool.reclaimed",
                    count = reclaimed.len(),
                    "reclaimed expired task runs"
                );
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(
                    event = "relay.pool.reclaim_error",
                    error = %err,
                    "lease reclaim failed"
                );
            }
        }

        let current_tasks = workers.iter().filter(|w| w.current_run().is_some()).count() as i32;
        if let Err(err) = store.heartbeat_worker_pool(&pool_id, current_tasks).await {
            tracing::warn!(
                event = "relay.pool.heartbeat_error",
                error = %err,
                "pool heartbeat failed"
            );
        }

        if let Err(err) = courier.retry_pending(10).await {
            tracing::warn!(
                event = "relay.pool.notification_retry_error",
                error = %err,
                "notification retry pass failed"
            );
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
