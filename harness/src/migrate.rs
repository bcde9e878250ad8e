use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use crate::config::HarnessConfig;

/// Run migrations for the harness database.
pub async fn run(cfg: &HarnessConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.database_url)
        .await
        .context("connect database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("migrate database")?;

    tracing::info!("migrations complete");
    Ok(())
}
