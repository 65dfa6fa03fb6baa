use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use crate::config::OrchestratorConfig;

/// Provision `host_0..host_{count-1}`.
///
/// Host provisioning is out-of-band for the orchestrator; this exists so a
/// local stack has a fleet to target without opening psql.
pub async fn run(cfg: &OrchestratorConfig, count: u32) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.postgres_url)
        .await
        .context("connect db")?;

    let hostnames: Vec<String> = (0..count).map(|i| format!("host_{i}")).collect();

    let inserted = sqlx::query(
        r#"
        INSERT INTO fleet.hosts (hostname)
        SELECT t.hostname
        FROM UNNEST($1::text[]) AS t(hostname)
        ON CONFLICT (hostname) DO NOTHING
        "#,
    )
    .bind(&hostnames)
    .execute(&pool)
    .await
    .context("seed hosts")?
    .rows_affected();

    println!("seeded {inserted} hosts ({count} requested)");
    Ok(())
}
