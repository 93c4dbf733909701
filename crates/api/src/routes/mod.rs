//! Route registration

pub mod payments;
pub mod reports;

use axum::{routing::get, routing::post, Json, Router};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// Build the full application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/payments/webhook", post(payments::stripe_webhook))
        .route("/payments/checkout", post(payments::create_checkout))
        .route("/payments/sync", post(payments::sync_all))
        .route("/payments/{request_id}/sync", post(payments::sync_payment))
        .route("/reports/{request_id}", get(reports::get_report))
        .route(
            "/reports/{request_id}/generate",
            post(reports::generate_report),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Liveness probe
async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
