//! axum routers and shared HTTP error mapping.
//!
//! Routes:
//! - `GET /lancache-heartbeat`     - Load-balancer health probe
//! - `GET /depot/{depot}/{*path}`  - Cached depot content
//!
//! Metrics listener:
//! - `GET /metrics`                - Prometheus metrics

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tracing::{error, warn};

use crate::AppState;
use crate::cache::StoreError;
use crate::metrics::MetricsRegistry;
use crate::origin::OriginError;

// ---------------------------------------------------------------------------
// Routers
// ---------------------------------------------------------------------------

/// Build the cache-facing [`Router`].
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/lancache-heartbeat", get(crate::health::heartbeat_handler))
        .route("/depot/{depot}/{*path}", get(super::depot::handle_depot))
        .with_state(state)
}

/// Build the [`Router`] for the separate metrics listener.
pub fn create_metrics_router(metrics: MetricsRegistry) -> Router {
    Router::new()
        .route("/metrics", get(handle_metrics))
        .with_state(metrics)
}

/// `GET /metrics`
///
/// Returns Prometheus metrics collected by the proxy.
async fn handle_metrics(State(metrics): State<MetricsRegistry>) -> Result<Response, AppError> {
    let buf = metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised before a response has been committed, mapped to HTTP
/// responses in one place.
#[derive(Debug)]
pub enum AppError {
    /// The request cannot be processed as sent.
    BadRequest(&'static str),
    /// Local cache directory or staging file could not be prepared.
    Store(StoreError),
    /// The origin was unreachable or rejected the request.
    Upstream(OriginError),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, format!("{msg}\n")).into_response(),
            AppError::Store(err) => {
                error!(error = %err, "local cache error");
                let msg = match err {
                    StoreError::CreateDir { .. } => "Failed to create cache directory\n",
                    _ => "Failed to prepare cache file\n",
                };
                (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
            }
            AppError::Upstream(err) => {
                warn!(error = %err, "upstream fetch failed");
                // Transport details stay in the log.
                let status = err.status_code();
                let body = format!("upstream server returned {}\n", status.as_u16());
                (status, body).into_response()
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}\n"),
                )
                    .into_response()
            }
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Store(err)
    }
}

impl From<OriginError> for AppError {
    fn from(err: OriginError) -> Self {
        AppError::Upstream(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
