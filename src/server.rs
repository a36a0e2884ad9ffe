use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use log::{error, info, warn};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::error::PipelensError;
use crate::providers::AzureProvider;
use crate::query::{BuildsPage, QueryParams};

/// Shared application state
pub struct AppState {
    pub provider: AzureProvider,
}

/// Domain error rendered as an HTTP response with a `{"detail": ...}` body.
#[derive(Debug)]
pub struct ApiError(PipelensError);

impl From<PipelensError> for ApiError {
    fn from(err: PipelensError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            PipelensError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PipelensError::UpstreamRateLimited { .. } | PipelensError::RateLimitExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            PipelensError::UpstreamAuth { .. }
            | PipelensError::UpstreamNotFound(_)
            | PipelensError::UpstreamUnavailable { .. }
            | PipelensError::UpstreamTimeout { .. }
            | PipelensError::Upstream(_) => StatusCode::BAD_GATEWAY,
            PipelensError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(serde_json::json!({
            "detail": self.0.to_string()
        }));

        let mut response = (status, body).into_response();
        if let PipelensError::RateLimitExceeded { retry_after } = &self.0 {
            let seconds = retry_after.as_secs_f64().ceil().clamp(1.0, u32::MAX as f64) as u64;
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }
        response
    }
}

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/builds", get(builds_handler))
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
}

/// Health check endpoint
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "pipelens"
    }))
}

/// Filtered, sorted, paginated build history.
pub async fn builds_handler(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<BuildsPage>, ApiError> {
    let params = QueryParams::from_pairs(pairs)?;

    match state.provider.query(&params).await {
        Ok(page) => {
            info!(
                "Served {} of {} builds (page {}, {} days)",
                page.count, page.total, page.page, page.days
            );
            Ok(Json(page))
        }
        Err(e) => {
            match &e {
                PipelensError::Validation(_) | PipelensError::RateLimitExceeded { .. } => {
                    warn!("Rejected build query: {e}")
                }
                _ => error!("Build query failed: {e}"),
            }
            Err(e.into())
        }
    }
}

/// Binds `addr` and serves the router until the process is stopped.
pub async fn serve(state: AppState, addr: &str) -> anyhow::Result<()> {
    use anyhow::Context;

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Pipelens listening on http://{addr}");
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
