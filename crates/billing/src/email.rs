//! Outbound payment notifications
//!
//! Best-effort email delivery via the Resend HTTP API. Every send is
//! fire-and-forget from the engine's point of view: a delivery failure
//! is logged and swallowed, it never fails or retries a payment
//! transition. When no API key is configured the service is disabled
//! and sends become no-ops.

use serde_json::json;

use crate::error::BillingResult;
use crate::tokens::{AccessTokenService, TokenType};

const RESEND_API_URL: &str = "https://api.resend.com/emails";

#[derive(Clone)]
pub struct PaymentEmailService {
    http: reqwest::Client,
    api_key: Option<String>,
    from_address: String,
    report_base_url: String,
    tokens: AccessTokenService,
}

impl PaymentEmailService {
    pub fn new(
        api_key: Option<String>,
        from_address: String,
        report_base_url: String,
        tokens: AccessTokenService,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            from_address,
            report_base_url,
            tokens,
        }
    }

    pub fn from_env(tokens: AccessTokenService) -> Self {
        Self::new(
            std::env::var("RESEND_API_KEY").ok(),
            std::env::var("EMAIL_FROM_ADDRESS")
                .unwrap_or_else(|_| "SupplyMatch <payments@supplymatch.io>".to_string()),
            std::env::var("REPORT_BASE_URL")
                .unwrap_or_else(|_| "https://app.supplymatch.io/reports".to_string()),
            tokens,
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    /// Payment confirmation with a tokenized link to the unlocked report
    pub async fn send_payment_confirmation(&self, email: &str, request_id: &str) {
        let link = match self.report_link(email, request_id) {
            Ok(link) => link,
            Err(e) => {
                tracing::error!(email = %email, request_id = %request_id, error = %e,
                    "Failed to build report access link for confirmation email");
                return;
            }
        };

        self.send(
            email,
            "Your supplier match report is ready",
            &format!(
                "<p>Thanks for your purchase. Your supplier match report for request \
                 <strong>{}</strong> is unlocked.</p>\
                 <p><a href=\"{}\">View your report</a> (link valid for 30 days).</p>",
                request_id, link
            ),
        )
        .await;
    }

    pub async fn send_subscription_activated(&self, email: &str, plan_name: &str, credits: i64) {
        self.send(
            email,
            "Your SupplyMatch subscription is active",
            &format!(
                "<p>Your <strong>{}</strong> subscription is active. \
                 {} match credits have been added to your account.</p>",
                plan_name, credits
            ),
        )
        .await;
    }

    pub async fn send_payment_failed(&self, email: &str) {
        self.send(
            email,
            "Payment failed",
            "<p>We could not process your latest payment. Please update your \
             payment method to keep your subscription active.</p>",
        )
        .await;
    }

    fn report_link(&self, email: &str, request_id: &str) -> BillingResult<String> {
        let token = self
            .tokens
            .generate(email, Some(request_id), TokenType::Payment)?;
        Ok(format!(
            "{}/{}?token={}",
            self.report_base_url.trim_end_matches('/'),
            request_id,
            token
        ))
    }

    async fn send(&self, to: &str, subject: &str, html: &str) {
        let Some(api_key) = &self.api_key else {
            tracing::debug!(to = %to, subject = %subject, "Email disabled, skipping send");
            return;
        };

        let body = json!({
            "from": self.from_address,
            "to": [to],
            "subject": subject,
            "html": html,
        });

        let result = self
            .http
            .post(RESEND_API_URL)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(to = %to, subject = %subject, "Email sent");
            }
            Ok(resp) => {
                tracing::error!(to = %to, subject = %subject, status = %resp.status(),
                    "Email provider rejected send");
            }
            Err(e) => {
                tracing::error!(to = %to, subject = %subject, error = %e, "Email send failed");
            }
        }
    }
}

impl std::fmt::Debug for PaymentEmailService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentEmailService")
            .field("enabled", &self.is_enabled())
            .field("from_address", &self.from_address)
            .finish()
    }
}
