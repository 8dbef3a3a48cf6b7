//! HTTP surface of the API server.

use crate::registration::{RegisterRequest, RegisterResponse, RegistrationService};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use canton_rs::Error;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::timeout::TimeoutLayer;

#[derive(Clone)]
pub struct AppState {
    pub registration: Arc<RegistrationService>,
}

/// JSON error envelope: `{ "error": <message>, "code": <status> }`.
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
        // The envelope carries the classified message only; wrapped causes
        // stay in the logs.
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

async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    let response = state.registration.register(request).await?;
    Ok(Json(response))
}

pub fn router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/register", post(register))
        .layer(TimeoutLayer::new(request_timeout))
        .with_state(state)
}

pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    request_timeout: Duration,
    mut shutdown: mpsc::Receiver<()>,
) -> eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "API server started");
    axum::serve(listener, router(state, request_timeout))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
