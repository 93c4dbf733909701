//! Billing error types
//!
//! One taxonomy for the whole payment core. Handlers at the webhook
//! boundary decide which of these are swallowed (partial reconciliation)
//! and which are surfaced to the provider for retry.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Malformed request from a caller (400)
    #[error("validation error: {0}")]
    Validation(String),

    /// Webhook payload failed signature verification (400, never processed)
    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// Webhook event carried an unexpected object
    #[error("webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    /// Missing payment record / account / report (404 unless reconstruction applies)
    #[error("not found: {0}")]
    NotFound(String),

    /// A deduction would drive the balance negative; nothing was written
    #[error("insufficient credits: have {available}, need {requested}")]
    InsufficientCredits { available: i64, requested: i64 },

    /// Stripe API call failed or timed out; caller may retry
    #[error("payment provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The payment record reached `succeeded` but a downstream step failed.
    /// Logged loudly, acked at the webhook boundary, repairable via sync.
    #[error("partial reconciliation failure: {0}")]
    PartialReconciliation(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("stripe error: {0}")]
    Stripe(#[from] stripe::StripeError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl BillingError {
    /// Whether the webhook boundary must still ack 200 for this error.
    ///
    /// Partial reconciliation: the payment record is terminal, retrying
    /// the webhook cannot help, the sync endpoints are the repair path.
    /// Unsupported events: the payload shape will not change on
    /// redelivery.
    pub fn is_ackable(&self) -> bool {
        matches!(
            self,
            BillingError::PartialReconciliation(_) | BillingError::WebhookEventNotSupported(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ackable_errors() {
        assert!(BillingError::PartialReconciliation("unlock failed".to_string()).is_ackable());
        assert!(
            BillingError::WebhookEventNotSupported("no session object".to_string()).is_ackable()
        );
    }

    #[test]
    fn test_retryable_errors_are_not_ackable() {
        assert!(!BillingError::Database("connection reset".to_string()).is_ackable());
        assert!(!BillingError::ProviderUnavailable("timeout".to_string()).is_ackable());
        assert!(!BillingError::WebhookSignatureInvalid.is_ackable());
        assert!(!BillingError::Internal("oops".to_string()).is_ackable());
    }
}
