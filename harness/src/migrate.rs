use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use crate::config::OrchestratorConfig;

pub async fn run(cfg: &OrchestratorConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.postgres_url)
        .await
        .context("connect db")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("migrate db")?;

    tracing::info!("migrations complete");
    Ok(())
}
