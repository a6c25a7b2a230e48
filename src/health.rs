//! Process health endpoint
//!
//! A single route: `GET /health` answers OK once registration with the
//! local scheduler has completed, 503 before that. Everything else about
//! operational visibility lives in logs.

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use axum::routing::get;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone)]
struct HealthState {
    registered: Arc<AtomicBool>,
}

async fn health(State(state): State<HealthState>) -> impl IntoResponse {
    if state.registered.load(Ordering::SeqCst) {
        (StatusCode::OK, Json(serde_json::json!({"status": "OK"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "STARTING"})),
        )
    }
}

/// Builds the health router over the shared registration flag.
#[must_use]
pub fn health_app(registered: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(HealthState { registered })
}
