//! Stripe client wrapper
//!
//! An explicitly constructed client + configuration pair that gets
//! injected into every service. Nothing in this crate reaches for a
//! global client; tests substitute a fake by constructing services with
//! their own `StripeConfig`.

use supplymatch_shared::PlanType;

use crate::error::{BillingError, BillingResult};

/// Stripe configuration loaded from environment or provided explicitly
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Price ids keyed by plan type
    pub price_report_unlock: String,
    pub price_starter_monthly: String,
    pub price_starter_annual: String,
    pub price_professional_monthly: String,
    pub price_professional_annual: String,
    pub price_credit_topup: String,
    /// Price of one credit in cents, used to derive top-up quantity when
    /// the session metadata omits it
    pub credit_unit_price_cents: i64,
    /// Base URL the checkout session redirects back to
    pub checkout_return_url: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = require_env("STRIPE_SECRET_KEY")?;
        let webhook_secret = require_env("STRIPE_WEBHOOK_SECRET")?;

        Ok(Self {
            secret_key,
            webhook_secret,
            price_report_unlock: env_or("STRIPE_PRICE_REPORT_UNLOCK", ""),
            price_starter_monthly: env_or("STRIPE_PRICE_STARTER_MONTHLY", ""),
            price_starter_annual: env_or("STRIPE_PRICE_STARTER_ANNUAL", ""),
            price_professional_monthly: env_or("STRIPE_PRICE_PROFESSIONAL_MONTHLY", ""),
            price_professional_annual: env_or("STRIPE_PRICE_PROFESSIONAL_ANNUAL", ""),
            price_credit_topup: env_or("STRIPE_PRICE_CREDIT_TOPUP", ""),
            credit_unit_price_cents: env_or("CREDIT_UNIT_PRICE_CENTS", "1000")
                .parse()
                .map_err(|_| {
                    BillingError::Internal("CREDIT_UNIT_PRICE_CENTS must be an integer".to_string())
                })?,
            checkout_return_url: env_or("CHECKOUT_RETURN_URL", "https://app.supplymatch.io"),
        })
    }

    /// Stripe price id for a plan type, None when not configured
    pub fn price_id(&self, plan: PlanType) -> Option<&str> {
        let id = match plan {
            PlanType::ReportUnlock => &self.price_report_unlock,
            PlanType::StarterMonthly => &self.price_starter_monthly,
            PlanType::StarterAnnual => &self.price_starter_annual,
            PlanType::ProfessionalMonthly => &self.price_professional_monthly,
            PlanType::ProfessionalAnnual => &self.price_professional_annual,
            PlanType::CreditTopup => &self.price_credit_topup,
            // Managed fees are invoiced ad hoc, not via catalog prices
            PlanType::ManagedServiceFee | PlanType::ManagedSavingsFee => return None,
        };
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    }
}

fn require_env(key: &str) -> BillingResult<String> {
    std::env::var(key)
        .map_err(|_| BillingError::Internal(format!("{} environment variable not set", key)))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Cloneable Stripe client carrying its configuration
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        Self { client, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    /// The underlying async-stripe client
    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

impl std::fmt::Debug for StripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret key
        f.debug_struct("StripeClient")
            .field("webhook_secret_len", &self.config.webhook_secret.len())
            .finish()
    }
}
