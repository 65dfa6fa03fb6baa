use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use fleet_api::ApiServer;
use fleet_core::{pgqueue::PgQueue, Queue};
use fleet_harness::{config::OrchestratorConfig, enqueue, migrate, seed};
use fleet_worker::{
    agent::{Agent, SimulatedAgent},
    Worker,
};

#[derive(Parser, Debug)]
#[command(name = "fleet-harness")]
#[command(about = "Fleet orchestrator operations harness", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run DB migrations.
    Migrate,

    /// Run the HTTP API server.
    Api,

    /// Run a queue worker.
    Worker,

    /// Run the beat scheduler (PUBLISH_OUTBOX cadence).
    Beat,

    /// Provision hosts host_0..host_{count-1}.
    SeedHosts {
        #[arg(long, default_value_t = 1000)]
        count: u32,
    },

    /// Manually enqueue a PLAN_JOB task for a job.
    Enqueue {
        #[arg(long)]
        job_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = OrchestratorConfig::from_env().context("load orchestrator config")?;

    match cli.command {
        Command::Migrate => migrate::run(&cfg).await,
        Command::Api => api_cmd(&cfg).await,
        Command::Worker => worker_cmd(&cfg).await,
        Command::Beat => beat_cmd(&cfg).await,
        Command::SeedHosts { count } => seed::run(&cfg, count).await,
        Command::Enqueue { job_id } => enqueue::run(&cfg, job_id).await,
    }
}

async fn api_cmd(cfg: &OrchestratorConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.postgres_url)
        .await
        .context("connect db")?;

    let bind: SocketAddr = cfg.api_bind.parse().context("parse API_BIND")?;
    let server = ApiServer::start(pool, bind).await?;

    tokio::signal::ctrl_c().await.context("wait for ctrl_c")?;
    server.shutdown().await
}

async fn worker_cmd(cfg: &OrchestratorConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&cfg.postgres_url)
        .await
        .context("connect db")?;

    let queue: Arc<dyn Queue> = Arc::new(PgQueue::new(pool.clone()));
    let agent: Arc<dyn Agent> = Arc::new(SimulatedAgent);

    let worker = Worker::new(pool, queue, agent, cfg.retry_policy(), cfg.worker_config());
    worker.run().await
}

async fn beat_cmd(cfg: &OrchestratorConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.postgres_url)
        .await
        .context("connect db")?;

    let queue = PgQueue::new(pool);
    fleet_worker::beat::run(
        &queue,
        &cfg.task_queue,
        Duration::from_millis(cfg.outbox_publish_interval_ms),
    )
    .await
}
