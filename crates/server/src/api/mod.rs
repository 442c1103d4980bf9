use crate::config::AppState;
use crate::websocket;
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;

/// Start the API server. Resolves when the shutdown signal fires.
pub async fn serve(
    addr: &str,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        // Flow surface
        .route("/api/_flows", get(handlers::list_flows))
        .route("/api/_flows/{flow}/start", post(handlers::start_flow))
        .route("/api/_flows/{flow}/runs", get(handlers::list_runs))
        .route("/api/_flows/{flow}/runs/{run_id}", get(handlers::get_run))
        .route(
            "/api/_flows/{flow}/runs/{run_id}/events",
            get(handlers::get_run_events),
        )
        .route(
            "/api/_flows/{flow}/runs/{run_id}/cancel",
            post(handlers::cancel_run),
        )
        .route(
            "/api/_flows/{flow}/runs/{run_id}/restart",
            post(handlers::restart_run),
        )
        .route(
            "/api/_flows/{flow}/clear-history",
            delete(handlers::clear_history),
        )
        // Await webhooks
        .route(
            "/api/_webhook/await/{flow}/{run_id}/{step}",
            post(handlers::resolve_webhook_await),
        )
        // Trigger surface
        .route("/api/_triggers", get(handlers::list_triggers))
        .route("/api/_triggers", post(handlers::register_trigger))
        .route("/api/_triggers/{name}/fire", post(handlers::fire_trigger))
        .route(
            "/api/_triggers/{name}/subscribe",
            post(handlers::subscribe_trigger),
        )
        // Real-time subscriptions
        .route("/api/_flows/ws", get(websocket::ws_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(false))
                .on_response(DefaultOnResponse::new()),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct HealthResponse {
    status: String,
}

/// Error payload shared by all endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Maps runtime errors onto HTTP statuses.
pub struct ApiError(nvent_core::Error);

impl From<nvent_core::Error> for ApiError {
    fn from(err: nvent_core::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            nvent_core::Error::UnknownFlow(_)
            | nvent_core::Error::UnknownRun(_)
            | nvent_core::Error::UnknownTrigger(_) => StatusCode::NOT_FOUND,
            nvent_core::Error::Config(_) | nvent_core::Error::InvalidCron { .. } => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}
