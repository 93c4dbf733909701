//! Payment routes: webhook, checkout creation, reconciliation sync

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;

use supplymatch_billing::{
    CheckoutRedirect, PaymentRecord, ReconcileOutcome, SyncSummary,
};
use supplymatch_shared::PlanType;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

// =============================================================================
// Webhook
// =============================================================================

/// Stripe webhook endpoint.
///
/// Status contract with the provider:
/// - 400: signature verification failed, the event was never processed
/// - 500: processing failed and a redelivery can still help
/// - 200: processed, duplicate, or a partial failure the sync endpoints
///   repair (redelivery cannot help once the record is terminal)
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let event = match state.payments.webhooks.verify_event(&body, signature) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(error = %e, "Webhook signature verification failed");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid signature" })),
            )
                .into_response();
        }
    };

    match state.payments.webhooks.handle_event(event).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "received": true }))).into_response(),
        Err(e) if e.is_ackable() => {
            // Already logged loudly downstream; acking prevents a retry
            // storm that cannot fix a terminal record
            (StatusCode::OK, Json(json!({ "received": true }))).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "Webhook processing failed, requesting redelivery");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "event processing failed" })),
            )
                .into_response()
        }
    }
}

// =============================================================================
// Checkout
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateCheckoutRequest {
    pub email: String,
    pub plan_type: String,
    pub request_id: Option<String>,
    /// Credit top-ups only
    pub quantity: Option<i64>,
}

pub async fn create_checkout(
    State(state): State<AppState>,
    Json(req): Json<CreateCheckoutRequest>,
) -> ApiResult<Json<CheckoutRedirect>> {
    let plan_type = PlanType::from_str(&req.plan_type)
        .map_err(|_| ApiError::BadRequest(format!("unknown plan type: {}", req.plan_type)))?;

    let redirect = state
        .payments
        .checkout
        .create_checkout(&req.email, req.request_id.as_deref(), plan_type, req.quantity)
        .await?;

    Ok(Json(redirect))
}

// =============================================================================
// Sync
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<PaymentRecord>,
}

impl From<ReconcileOutcome> for SyncResponse {
    fn from(outcome: ReconcileOutcome) -> Self {
        let status = outcome.status_label();
        match outcome {
            ReconcileOutcome::Applied { payment, warning } => Self {
                status,
                message: None,
                warning,
                payment: Some(payment),
            },
            ReconcileOutcome::AlreadyApplied(payment) => Self {
                status,
                message: None,
                warning: None,
                payment: Some(payment),
            },
            ReconcileOutcome::NotCompleted { payment, message } => Self {
                status,
                message: Some(message),
                warning: None,
                payment,
            },
        }
    }
}

/// Replay reconciliation for the latest payment on one request.
///
/// "Not found or not yet completed" is a normal response here, not an
/// error: the caller is asking for best-known state.
pub async fn sync_payment(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
    Json(req): Json<SyncRequest>,
) -> ApiResult<Json<SyncResponse>> {
    let outcome = state
        .payments
        .engine
        .sync_payment(&request_id, &req.email)
        .await?;
    Ok(Json(SyncResponse::from(outcome)))
}

/// Replay reconciliation for every pending payment an owner has
pub async fn sync_all(
    State(state): State<AppState>,
    Json(req): Json<SyncRequest>,
) -> ApiResult<Json<SyncSummary>> {
    let summary = state.payments.engine.sync_all(&req.email).await?;
    Ok(Json(summary))
}
