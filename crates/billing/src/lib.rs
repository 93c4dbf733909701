// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Some Stripe operations require many parameters
#![allow(clippy::field_reassign_with_default)] // Used for conditional struct field setting
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! SupplyMatch Payment Core
//!
//! Payment reconciliation and entitlement management for the supplier
//! matching marketplace.
//!
//! ## Features
//!
//! - **Reconciliation Engine**: webhook, per-request sync, and sync-all
//!   all funnel into one idempotent payment transition
//! - **Credit Ledger**: append-only accounting for every balance change
//! - **Entitlement Resolver**: subscription allocations with rollover and
//!   calendar expiry
//! - **Report Unlock Gate**: pending -> unlocked -> completed reveal of
//!   supplier match reports
//! - **Access Tokens**: HMAC-signed, email-bound report access
//! - **Managed Workflows**: audit-only fee tracking for managed sourcing
//! - **Email Notifications**: payment confirmation, subscription
//!   activated, payment failed
//! - **Invariants**: runnable consistency checks over the whole system

pub mod accounts;
pub mod checkout;
pub mod client;
pub mod email;
pub mod entitlement;
pub mod error;
pub mod invariants;
pub mod ledger;
pub mod managed;
pub mod payments;
pub mod plans;
pub mod reconcile;
pub mod reports;
pub mod tokens;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Accounts
pub use accounts::{normalize_email, Account, AccountService};

// Checkout
pub use checkout::{CheckoutRedirect, CheckoutService};

// Client
pub use client::{StripeClient, StripeConfig};

// Email
pub use email::PaymentEmailService;

// Entitlement
pub use entitlement::{add_calendar_months, resolve_allocation, Allocation};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{CreditLedger, CreditTransaction};

// Managed workflows
pub use managed::{ManagedService, ManagedWorkflowService};

// Payment records
pub use payments::{PaymentRecord, PaymentRecordService, Transition};

// Plans
pub use plans::{legacy_default, PlanCatalog, PlanCredits};

// Reconciliation
pub use reconcile::{
    InvoiceFacts, PaymentPurpose, ReconcileOutcome, ReconciliationEngine, SessionFacts,
    SyncSummary,
};

// Reports
pub use reports::{
    MatchReport, MatchRequestSummary, MatchScore, MatchScorer, ReportPreview, ReportService,
    ScoredSupplier, Supplier,
};

// Tokens
pub use tokens::{AccessTokenService, TokenClaims, TokenType};

// Webhooks
pub use webhooks::WebhookHandler;

use sqlx::PgPool;
use std::sync::Arc;

/// Main payment service that combines all payment functionality
pub struct PaymentService {
    pub accounts: AccountService,
    pub records: PaymentRecordService,
    pub ledger: CreditLedger,
    pub catalog: PlanCatalog,
    pub reports: ReportService,
    pub managed: ManagedWorkflowService,
    pub checkout: CheckoutService,
    pub email: PaymentEmailService,
    pub engine: ReconciliationEngine,
    pub webhooks: WebhookHandler,
    pub tokens: AccessTokenService,
    pub invariants: InvariantChecker,
}

impl PaymentService {
    /// Create a new payment service from environment variables
    pub fn from_env(pool: PgPool, scorer: Arc<dyn MatchScorer>) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let tokens = AccessTokenService::from_env()?;
        Ok(Self::build(stripe, tokens, pool, scorer))
    }

    /// Create a new payment service with explicit configuration
    pub fn new(
        config: StripeConfig,
        token_secret: impl Into<String>,
        pool: PgPool,
        scorer: Arc<dyn MatchScorer>,
    ) -> Self {
        Self::build(
            StripeClient::new(config),
            AccessTokenService::new(token_secret),
            pool,
            scorer,
        )
    }

    fn build(
        stripe: StripeClient,
        tokens: AccessTokenService,
        pool: PgPool,
        scorer: Arc<dyn MatchScorer>,
    ) -> Self {
        let accounts = AccountService::new(pool.clone());
        let records = PaymentRecordService::new(pool.clone());
        let ledger = CreditLedger::new(pool.clone());
        let catalog = PlanCatalog::new(pool.clone());
        let email = PaymentEmailService::from_env(tokens.clone());
        let reports = ReportService::new(pool.clone(), ledger.clone(), tokens.clone(), scorer);
        let managed = ManagedWorkflowService::new(pool.clone());
        let checkout = CheckoutService::new(stripe.clone(), records.clone(), tokens.clone());
        let engine = ReconciliationEngine::new(
            pool.clone(),
            stripe.clone(),
            accounts.clone(),
            records.clone(),
            ledger.clone(),
            catalog.clone(),
            reports.clone(),
            managed.clone(),
            email.clone(),
        );
        let webhooks = WebhookHandler::new(stripe, pool.clone(), engine.clone());
        let invariants = InvariantChecker::new(pool);

        Self {
            accounts,
            records,
            ledger,
            catalog,
            reports,
            managed,
            checkout,
            email,
            engine,
            webhooks,
            tokens,
            invariants,
        }
    }
}
