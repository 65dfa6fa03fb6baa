//! Fleet orchestrator HTTP service.
//!
//! Exposes the webhook intake, the approval gate, job/execution/log read
//! endpoints, and the host block policy. Every mutating endpoint is a single
//! database transaction; asynchronous work is handed off through the
//! transactional outbox, never enqueued directly from a request handler.

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use sqlx::PgPool;
use std::{net::SocketAddr, str::FromStr, sync::Arc};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};
use uuid::Uuid;

use fleet_core::CommandType;

pub mod hosts;
pub mod jobs;
pub mod rollup;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
}

#[derive(Debug)]
pub struct ApiServer {
    pub addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl ApiServer {
    pub async fn start(pool: PgPool, bind: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind api to {bind}"))?;
        let addr = listener.local_addr().context("api local_addr")?;

        let state = Arc::new(AppState { pool });
        let app = build_router(state);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run_server(listener, app, shutdown_rx));

        tracing::info!(event = "fleet.api.started", addr = %addr, "api started");
        Ok(Self {
            addr,
            shutdown_tx,
            join,
        })
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.join.await.context("join api task")??;
        Ok(())
    }
}

async fn run_server(
    listener: TcpListener,
    app: Router,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("api serve")
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook/jobs/", post(create_job))
        .route("/jobs/", get(list_jobs))
        .route("/jobs/:job_id/", get(job_detail))
        .route("/jobs/:job_id/approve/", post(approve_job))
        .route("/jobs/:job_id/reject/", post(reject_job))
        .route("/jobs/:job_id/executions", get(job_executions))
        .route("/jobs/executions/:execution_id/logs", get(execution_logs))
        .route("/hosts/:host_id/blocks", put(set_host_blocks))
        .route(
            "/hosts/:host_id/blocks/:command_type",
            delete(delete_host_block),
        )
        .with_state(state)
}

async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(req): Json<jobs::CreateJobRequest>,
) -> ApiResult<Json<jobs::JobCreated>> {
    Ok(Json(jobs::create_job(&state.pool, &req).await?))
}

#[derive(Debug, Deserialize)]
struct Pagination {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(page): Query<Pagination>,
) -> ApiResult<Json<Vec<jobs::JobListItem>>> {
    let items = jobs::list_jobs(
        &state.pool,
        page.limit.unwrap_or(50),
        page.offset.unwrap_or(0),
    )
    .await?;
    Ok(Json(items))
}

async fn job_detail(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<jobs::JobDetail>> {
    Ok(Json(jobs::job_detail(&state.pool, job_id).await?))
}

async fn approve_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<jobs::ApproveResponse>> {
    Ok(Json(jobs::approve_job(&state.pool, job_id).await?))
}

async fn reject_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<jobs::RejectResponse>> {
    Ok(Json(jobs::reject_job(&state.pool, job_id).await?))
}

#[derive(Debug, Deserialize)]
struct ExecutionFilter {
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn job_executions(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
    Query(filter): Query<ExecutionFilter>,
) -> ApiResult<Json<Vec<jobs::ExecutionView>>> {
    let status = filter
        .status
        .as_deref()
        .map(fleet_core::ExecutionStatus::from_str)
        .transpose()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    let items = jobs::job_executions(
        &state.pool,
        job_id,
        status,
        filter.limit.unwrap_or(50),
        filter.offset.unwrap_or(0),
    )
    .await?;
    Ok(Json(items))
}

async fn execution_logs(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<Uuid>,
) -> ApiResult<Json<Vec<jobs::LogLine>>> {
    Ok(Json(jobs::execution_logs(&state.pool, execution_id).await?))
}

async fn set_host_blocks(
    State(state): State<Arc<AppState>>,
    Path(host_id): Path<Uuid>,
    Json(body): Json<hosts::SetBlocksRequest>,
) -> ApiResult<Json<hosts::BlocksReplaced>> {
    Ok(Json(
        hosts::set_host_blocks(&state.pool, host_id, &body.commands).await?,
    ))
}

async fn delete_host_block(
    State(state): State<Arc<AppState>>,
    Path((host_id, command_type)): Path<(Uuid, String)>,
) -> ApiResult<Json<hosts::BlockDeleted>> {
    let command = CommandType::from_str(&command_type)
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    Ok(Json(
        hosts::delete_host_block(&state.pool, host_id, command).await?,
    ))
}

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        tracing::error!(
            event = "fleet.api.internal_error",
            error = %err,
            "api internal error"
        );
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}
