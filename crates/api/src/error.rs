//! API error type and response mapping
//!
//! Every handler returns `ApiResult<T>`; the `IntoResponse` impl is the
//! single place billing errors are translated to HTTP statuses. The
//! webhook route does NOT use this mapping for processing errors, see
//! `routes::payments::stripe_webhook`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use supplymatch_billing::BillingError;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Billing(e) => match e {
                BillingError::Validation(_)
                | BillingError::WebhookSignatureInvalid
                | BillingError::InsufficientCredits { .. } => StatusCode::BAD_REQUEST,
                BillingError::NotFound(_) => StatusCode::NOT_FOUND,
                BillingError::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal detail stays in the logs, not the response body
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Internal error serving request");
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_error_status_mapping() {
        let cases = [
            (
                ApiError::from(BillingError::Validation("bad".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(BillingError::WebhookSignatureInvalid),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(BillingError::InsufficientCredits {
                    available: 0,
                    requested: 1,
                }),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(BillingError::NotFound("report".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(BillingError::ProviderUnavailable("timeout".into())),
                StatusCode::BAD_GATEWAY,
            ),
            (
                ApiError::from(BillingError::Database("down".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ApiError::from(BillingError::PartialReconciliation("email".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(err.status(), expected, "wrong status for {err}");
        }
    }
}
