//! Checkout session creation
//!
//! Builds the Stripe checkout session for a plan purchase and persists
//! the pending payment record keyed by the session id in the same call.
//! Session metadata is the contract with the reconciliation engine: it
//! carries everything the engine needs to classify and apply the payment
//! later, including a pre-generated report access token so the
//! confirmation path never has to mint one under time pressure.

use std::collections::HashMap;

use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
};
use supplymatch_shared::PlanType;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::payments::{PaymentRecord, PaymentRecordService};
use crate::tokens::{AccessTokenService, TokenType};

/// Metadata keys carried on every checkout session. The engine reads
/// these back from `checkout.session.completed` payloads.
pub mod metadata {
    pub const EMAIL: &str = "email";
    pub const REQUEST_ID: &str = "request_id";
    pub const PURPOSE: &str = "purpose";
    pub const PLAN_TYPE: &str = "plan_type";
    pub const QUANTITY: &str = "quantity";
    pub const ACCESS_TOKEN: &str = "access_token";

    pub const PURPOSE_STANDARD: &str = "standard";
    pub const PURPOSE_CREDIT_TOPUP: &str = "credit_topup";
    pub const PURPOSE_MANAGED_FEE: &str = "managed_service_fee";
    pub const PURPOSE_MANAGED_SAVINGS: &str = "managed_savings_fee";
}

/// What the API hands back to the caller for redirect
#[derive(Debug, Clone, serde::Serialize)]
pub struct CheckoutRedirect {
    pub checkout_url: String,
    pub session_id: String,
}

#[derive(Clone)]
pub struct CheckoutService {
    stripe: StripeClient,
    records: PaymentRecordService,
    tokens: AccessTokenService,
}

impl CheckoutService {
    pub fn new(
        stripe: StripeClient,
        records: PaymentRecordService,
        tokens: AccessTokenService,
    ) -> Self {
        Self {
            stripe,
            records,
            tokens,
        }
    }

    /// Create a checkout session and its pending payment record.
    ///
    /// Top-ups accept a `quantity` of credits; everything else is a
    /// single line item. Managed fees are invoiced ad hoc and cannot be
    /// purchased through the catalog.
    pub async fn create_checkout(
        &self,
        email: &str,
        request_id: Option<&str>,
        plan_type: PlanType,
        quantity: Option<i64>,
    ) -> BillingResult<CheckoutRedirect> {
        if plan_type.is_managed_fee() {
            return Err(BillingError::Validation(
                "managed service fees are invoiced directly, not purchased at checkout".to_string(),
            ));
        }

        let email = email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(BillingError::Validation("a valid email is required".to_string()));
        }

        let config = self.stripe.config();
        let price_id = config.price_id(plan_type).ok_or_else(|| {
            BillingError::Validation(format!("plan {} is not available for purchase", plan_type))
        })?;

        let access_token = self
            .tokens
            .generate(&email, request_id, TokenType::Payment)?;

        let mut meta: HashMap<String, String> = HashMap::new();
        meta.insert(metadata::EMAIL.to_string(), email.clone());
        meta.insert(metadata::PLAN_TYPE.to_string(), plan_type.as_str().to_string());
        meta.insert(metadata::PURPOSE.to_string(), purpose_for(plan_type).to_string());
        meta.insert(metadata::ACCESS_TOKEN.to_string(), access_token);
        if let Some(rid) = request_id {
            meta.insert(metadata::REQUEST_ID.to_string(), rid.to_string());
        }
        if let Some(qty) = quantity {
            if plan_type != PlanType::CreditTopup {
                return Err(BillingError::Validation(
                    "quantity is only valid for credit top-ups".to_string(),
                ));
            }
            if qty <= 0 {
                return Err(BillingError::Validation(
                    "quantity must be positive".to_string(),
                ));
            }
            meta.insert(metadata::QUANTITY.to_string(), qty.to_string());
        }

        let success_url = format!(
            "{}/payments/success?session_id={{CHECKOUT_SESSION_ID}}",
            config.checkout_return_url.trim_end_matches('/')
        );
        let cancel_url = format!(
            "{}/payments/canceled",
            config.checkout_return_url.trim_end_matches('/')
        );

        let line_quantity = match plan_type {
            PlanType::CreditTopup => quantity.unwrap_or(1) as u64,
            _ => 1,
        };

        let mut params = CreateCheckoutSession::new();
        params.mode = Some(if plan_type.is_recurring() {
            CheckoutSessionMode::Subscription
        } else {
            CheckoutSessionMode::Payment
        });
        params.line_items = Some(vec![CreateCheckoutSessionLineItems {
            price: Some(price_id.to_string()),
            quantity: Some(line_quantity),
            ..Default::default()
        }]);
        params.customer_email = Some(&email);
        params.client_reference_id = request_id;
        params.success_url = Some(&success_url);
        params.cancel_url = Some(&cancel_url);
        params.metadata = Some(meta);

        let session = CheckoutSession::create(self.stripe.inner(), params)
            .await
            .map_err(|e| {
                tracing::error!(email = %email, plan = %plan_type, error = %e,
                    "Checkout session creation failed");
                BillingError::ProviderUnavailable("could not start checkout".to_string())
            })?;

        let checkout_url = session.url.clone().ok_or_else(|| {
            BillingError::ProviderUnavailable("checkout session has no redirect URL".to_string())
        })?;

        let record = self
            .pending_record(&session, request_id, &email, plan_type)
            .await?;

        tracing::info!(
            session_id = %session.id,
            payment_record_id = %record.id,
            email = %email,
            plan = %plan_type,
            "Checkout session created"
        );

        Ok(CheckoutRedirect {
            checkout_url,
            session_id: session.id.to_string(),
        })
    }

    async fn pending_record(
        &self,
        session: &CheckoutSession,
        request_id: Option<&str>,
        email: &str,
        plan_type: PlanType,
    ) -> BillingResult<PaymentRecord> {
        self.records
            .create_pending(
                session.id.as_str(),
                request_id,
                email,
                session.amount_total.unwrap_or(0),
                plan_type,
            )
            .await
    }
}

/// Map a plan to the purpose tag the engine classifies on
pub fn purpose_for(plan_type: PlanType) -> &'static str {
    match plan_type {
        PlanType::CreditTopup => metadata::PURPOSE_CREDIT_TOPUP,
        PlanType::ManagedServiceFee => metadata::PURPOSE_MANAGED_FEE,
        PlanType::ManagedSavingsFee => metadata::PURPOSE_MANAGED_SAVINGS,
        _ => metadata::PURPOSE_STANDARD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purpose_classification() {
        assert_eq!(purpose_for(PlanType::ReportUnlock), "standard");
        assert_eq!(purpose_for(PlanType::StarterMonthly), "standard");
        assert_eq!(purpose_for(PlanType::ProfessionalAnnual), "standard");
        assert_eq!(purpose_for(PlanType::CreditTopup), "credit_topup");
        assert_eq!(purpose_for(PlanType::ManagedServiceFee), "managed_service_fee");
        assert_eq!(purpose_for(PlanType::ManagedSavingsFee), "managed_savings_fee");
    }
}
