//! Relayer HTTP surface: health and readiness probes, Prometheus
//! exposition, and the transfer status API.

use crate::pipelines::ReadyState;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use canton_rs::store::{self, TokenMetricsRow, Transfer, TransferCounts};
use canton_rs::types::Direction;
use canton_rs::Error;
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub ready: Arc<ReadyState>,
    pub started_at: Instant,
}

/// JSON error envelope shared by all endpoints.
#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: u16,
}

struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.kind().http_status();
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            Json(ErrorBody {
                error: self.0.message().to_string(),
                code,
            }),
        )
            .into_response()
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        ApiError(error)
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn ready(State(state): State<AppState>) -> Response {
    if state.ready.is_ready() {
        (StatusCode::OK, "READY").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT_READY").into_response()
    }
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }
    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(response) => response,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct TransfersQuery {
    limit: Option<i64>,
    direction: Option<String>,
}

async fn list_transfers(
    State(state): State<AppState>,
    Query(query): Query<TransfersQuery>,
) -> Result<Json<Vec<Transfer>>, ApiError> {
    let direction = match query.direction.as_deref() {
        None => None,
        Some("in") => Some(Direction::Inbound),
        Some("out") => Some(Direction::Outbound),
        Some(other) => {
            return Err(Error::invalid_input(format!("unknown direction {other:?}")).into())
        }
    };
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let transfers = store::list_transfers(&state.db, direction, limit).await?;
    Ok(Json(transfers))
}

async fn get_transfer(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Transfer>, ApiError> {
    let transfer = store::transfer_by_id(&state.db, id)
        .await?
        .ok_or_else(|| Error::not_found(format!("no transfer with id {id}")))?;
    Ok(Json(transfer))
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    ready: bool,
    uptime_seconds: u64,
    cursors: CursorStatus,
    queues: QueueStatus,
    tokens: Vec<TokenMetricsRow>,
}

#[derive(Serialize)]
struct CursorStatus {
    #[serde(rename = "in")]
    inbound: Option<i64>,
    #[serde(rename = "out")]
    outbound: Option<i64>,
}

#[derive(Serialize)]
struct QueueStatus {
    #[serde(rename = "in")]
    inbound: TransferCounts,
    #[serde(rename = "out")]
    outbound: TransferCounts,
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    Ok(Json(StatusResponse {
        status: "ok",
        ready: state.ready.is_ready(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        cursors: CursorStatus {
            inbound: store::cursor(&state.db, Direction::Inbound).await?,
            outbound: store::cursor(&state.db, Direction::Outbound).await?,
        },
        queues: QueueStatus {
            inbound: store::transfer_counts(&state.db, Direction::Inbound).await?,
            outbound: store::transfer_counts(&state.db, Direction::Outbound).await?,
        },
        tokens: store::token_metrics(&state.db).await?,
    }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(prometheus_metrics))
        .route("/api/v1/transfers", get(list_transfers))
        .route("/api/v1/transfers/{id}", get(get_transfer))
        .route("/api/v1/status", get(status))
        .with_state(state)
}

/// Serve the API until the shutdown channel fires.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    mut shutdown: mpsc::Receiver<()>,
) -> eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Relayer API server started");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
