//! Stripe webhook handling
//!
//! Verifies the `Stripe-Signature` header, claims exclusive processing
//! rights for the event id, and dispatches to the reconciliation
//! engine. Nothing is persisted for an event that fails verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{Event, EventObject, EventType, Expandable, Webhook};
use supplymatch_shared::PaymentStatus;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::reconcile::{InvoiceFacts, ReconciliationEngine, SessionFacts};

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted clock skew between the signature timestamp and now
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// A claimed event stuck in `processing` longer than this can be
/// re-claimed (crash recovery).
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

pub struct WebhookHandler {
    stripe: StripeClient,
    pool: PgPool,
    engine: ReconciliationEngine,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool, engine: ReconciliationEngine) -> Self {
        Self {
            stripe,
            pool,
            engine,
        }
    }

    /// Verify and parse a Stripe webhook event.
    ///
    /// Tries the library verification first, then falls back to manual
    /// signature verification; newer Stripe API versions ship payload
    /// shapes the library's strict parser rejects even when the
    /// signature is good.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(
                    stripe_error = %e,
                    "Library webhook verification failed, trying manual verification"
                );
            }
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature_at(payload, signature, webhook_secret, now)?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Manual webhook verification passed"
        );
        Ok(event)
    }

    /// Handle a verified Stripe event.
    ///
    /// An INSERT...ON CONFLICT...RETURNING on `stripe_webhook_events`
    /// atomically claims exclusive processing rights; two concurrent
    /// deliveries of the same event cannot both pass. Events stuck in
    /// `processing` past the timeout are re-claimed.
    pub async fn handle_event(&self, event: Event) -> BillingResult<()> {
        let event_id = event.id.to_string();
        let event_type_str = event.type_.to_string();
        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        // A row that finished as 'error' stays claimed: redelivery of the
        // same event id is reported as a duplicate, and the sync
        // endpoints are the repair path for it.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Recovered from stuck state at ', NOW()::TEXT)
            WHERE stripe_webhook_events.processing_result = 'processing'
              AND stripe_webhook_events.processing_started_at < NOW() - ($4 || ' minutes')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(&event_id)
        .bind(&event_type_str)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_none() {
            let existing_status: Option<(String,)> = sqlx::query_as(
                "SELECT processing_result FROM stripe_webhook_events WHERE stripe_event_id = $1",
            )
            .bind(&event_id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten();

            tracing::info!(
                event_id = %event_id,
                event_type = %event_type_str,
                existing_status = ?existing_status.map(|(s,)| s),
                "Duplicate webhook event, skipping"
            );
            return Ok(());
        }

        tracing::info!(
            event_type = %event_type_str,
            event_id = %event_id,
            "Processing webhook event"
        );

        let result = self.process_event(&event).await;

        let (processing_result, error_message) = match &result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };

        if let Err(e) = sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(processing_result)
        .bind(&error_message)
        .bind(&event_id)
        .execute(&self.pool)
        .await
        {
            tracing::error!(
                event_id = %event_id,
                processing_result = %processing_result,
                error = %e,
                "Failed to record webhook processing result; event may appear stuck in 'processing'"
            );
        }

        result
    }

    async fn process_event(&self, event: &Event) -> BillingResult<()> {
        match event.type_ {
            EventType::CheckoutSessionCompleted => {
                let EventObject::CheckoutSession(session) = &event.data.object else {
                    return Err(BillingError::WebhookEventNotSupported(
                        "checkout.session.completed without a session object".to_string(),
                    ));
                };
                let completed_at = OffsetDateTime::from_unix_timestamp(event.created)
                    .unwrap_or_else(|_| OffsetDateTime::now_utc());
                let facts = SessionFacts::from_checkout_session(session, None, completed_at)?;
                let outcome = self.engine.apply_completed_session(&facts).await?;
                if let Some(warning) = outcome.warning() {
                    // The record is terminal; redelivery cannot help. The
                    // ackable error records the failure on the claim row
                    // while the boundary still returns 200.
                    return Err(BillingError::PartialReconciliation(warning.to_string()));
                }
                Ok(())
            }
            EventType::CheckoutSessionExpired => {
                let EventObject::CheckoutSession(session) = &event.data.object else {
                    return Err(BillingError::WebhookEventNotSupported(
                        "checkout.session.expired without a session object".to_string(),
                    ));
                };
                self.engine
                    .records()
                    .mark_terminal(session.id.as_str(), PaymentStatus::Canceled)
                    .await?;
                Ok(())
            }
            EventType::CustomerSubscriptionDeleted => {
                let EventObject::Subscription(subscription) = &event.data.object else {
                    return Err(BillingError::WebhookEventNotSupported(
                        "customer.subscription.deleted without a subscription object".to_string(),
                    ));
                };
                let customer_id = match &subscription.customer {
                    Expandable::Id(id) => id.to_string(),
                    Expandable::Object(customer) => customer.id.to_string(),
                };
                self.engine
                    .handle_subscription_deleted(
                        Some(&customer_id),
                        Some(subscription.id.as_str()),
                    )
                    .await
            }
            EventType::InvoicePaid => {
                let facts = invoice_facts(event)?;
                self.engine.handle_invoice_paid(&facts).await
            }
            EventType::InvoicePaymentFailed => {
                let facts = invoice_facts(event)?;
                self.engine
                    .handle_invoice_payment_failed(facts.customer_id.as_deref())
                    .await
            }
            _ => {
                tracing::debug!(event_type = %event.type_, "Unhandled webhook event type");
                Ok(())
            }
        }
    }
}

fn invoice_facts(event: &Event) -> BillingResult<InvoiceFacts> {
    let EventObject::Invoice(invoice) = &event.data.object else {
        return Err(BillingError::WebhookEventNotSupported(format!(
            "{} without an invoice object",
            event.type_
        )));
    };

    Ok(InvoiceFacts {
        invoice_id: invoice.id.to_string(),
        billing_reason: invoice.billing_reason.map(|r| r.as_str().to_string()),
        customer_id: invoice.customer.as_ref().map(|c| match c {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(customer) => customer.id.to_string(),
        }),
        subscription_id: invoice.subscription.as_ref().map(|s| match s {
            Expandable::Id(id) => id.to_string(),
            Expandable::Object(sub) => sub.id.to_string(),
        }),
    })
}

/// Manual verification of a `Stripe-Signature` header against a payload
/// at a given clock reading. Header format: `t=timestamp,v1=hex,...`.
pub fn verify_signature_at(
    payload: &str,
    signature: &str,
    webhook_secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in signature.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => v1_signature = Some(value),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::error!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    let v1_signature = v1_signature.ok_or_else(|| {
        tracing::error!("Missing v1 signature in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::error!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    // The configured secret carries a "whsec_" prefix
    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::error!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";

    fn sign(payload: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(b"test_secret").unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("t={},v1={}", timestamp, sig)
    }

    #[test]
    fn test_valid_signature_accepted() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, 1_700_000_000);
        assert!(verify_signature_at(payload, &header, SECRET, 1_700_000_000).is_ok());
    }

    #[test]
    fn test_tolerance_boundary() {
        let payload = "{}";
        let header = sign(payload, 1_700_000_000);
        // 300 s of skew in either direction is still accepted
        assert!(verify_signature_at(payload, &header, SECRET, 1_700_000_300).is_ok());
        assert!(verify_signature_at(payload, &header, SECRET, 1_699_999_700).is_ok());
        // 301 s is not
        assert!(verify_signature_at(payload, &header, SECRET, 1_700_000_301).is_err());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let header = sign(r#"{"id":"evt_1"}"#, 1_700_000_000);
        assert!(verify_signature_at(r#"{"id":"evt_2"}"#, &header, SECRET, 1_700_000_000).is_err());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = "{}";
        let header = sign(payload, 1_700_000_000);
        assert!(verify_signature_at(payload, &header, "whsec_other", 1_700_000_000).is_err());
    }

    #[test]
    fn test_malformed_header_rejected() {
        assert!(verify_signature_at("{}", "", SECRET, 0).is_err());
        assert!(verify_signature_at("{}", "t=123", SECRET, 123).is_err());
        assert!(verify_signature_at("{}", "v1=abcd", SECRET, 0).is_err());
        assert!(verify_signature_at("{}", "garbage", SECRET, 0).is_err());
    }

    #[test]
    fn test_secret_prefix_is_stripped() {
        let payload = "{}";
        let header = sign(payload, 42);
        // Same key with and without the whsec_ prefix verifies alike
        assert!(verify_signature_at(payload, &header, "test_secret", 42).is_ok());
        assert!(verify_signature_at(payload, &header, "whsec_test_secret", 42).is_ok());
    }
}
