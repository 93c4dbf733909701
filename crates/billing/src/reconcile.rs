//! Payment reconciliation engine
//!
//! The single authority for moving a payment record to a terminal state
//! and applying what the money bought. Three entry points funnel into
//! the same transition procedure: the `checkout.session.completed`
//! webhook, per-request sync, and sync-all. Whichever path arrives
//! first wins the conditional status update; every other path
//! short-circuits to the already-applied answer.
//!
//! ## Rules
//!
//! - The terminal write happens before any side effect. A side-effect
//!   failure after the terminal write is logged loudly and surfaced as
//!   a warning, never as a rolled-back payment.
//! - Side effects are classified by the session metadata `purpose`:
//!   managed fees are audit-only, top-ups add credits (optionally
//!   consuming one for a bound request), everything else flows through
//!   the entitlement resolver or the report unlock gate.
//! - Report generation is only ever *triggered* here; a scorer failure
//!   leaves the report unlocked and the payment succeeded.

use sqlx::PgPool;
use stripe::{CheckoutSession, CheckoutSessionPaymentStatus, CheckoutSessionStatus, Expandable};
use supplymatch_shared::{
    PaymentStatus, PlanType, SubscriptionStatus, TransactionReason, TransactionType,
};
use time::OffsetDateTime;

use crate::accounts::{normalize_email, Account, AccountService};
use crate::checkout::metadata;
use crate::client::StripeClient;
use crate::email::PaymentEmailService;
use crate::entitlement::{resolve_allocation, Allocation};
use crate::error::{BillingError, BillingResult};
use crate::ledger::CreditLedger;
use crate::managed::ManagedWorkflowService;
use crate::payments::{PaymentRecord, PaymentRecordService, Transition};
use crate::plans::PlanCatalog;
use crate::reports::ReportService;

/// What a completed payment is for, classified from session metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentPurpose {
    /// Report unlock or subscription purchase
    Standard,
    CreditTopup,
    ManagedFee,
    ManagedSavings,
}

impl PaymentPurpose {
    /// Classify from the raw metadata value, falling back to the plan
    /// type when the metadata is absent (records reconstructed from
    /// sparse events).
    pub fn classify(raw: Option<&str>, plan: PlanType) -> Self {
        match raw {
            Some(metadata::PURPOSE_CREDIT_TOPUP) => Self::CreditTopup,
            Some(metadata::PURPOSE_MANAGED_FEE) => Self::ManagedFee,
            Some(metadata::PURPOSE_MANAGED_SAVINGS) => Self::ManagedSavings,
            Some(_) => Self::Standard,
            None => match plan {
                PlanType::CreditTopup => Self::CreditTopup,
                PlanType::ManagedServiceFee => Self::ManagedFee,
                PlanType::ManagedSavingsFee => Self::ManagedSavings,
                _ => Self::Standard,
            },
        }
    }
}

/// Everything the transition procedure needs from a completed checkout
/// session, decoupled from the provider's types so the procedure can be
/// driven by webhooks, sync re-queries, and tests alike.
#[derive(Debug, Clone)]
pub struct SessionFacts {
    pub session_id: String,
    pub payment_intent_id: Option<String>,
    pub email: String,
    pub request_id: Option<String>,
    pub purpose: PaymentPurpose,
    pub plan_type: PlanType,
    pub amount_cents: i64,
    /// Credit quantity from metadata; derived from the amount when absent
    pub quantity: Option<i64>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub paid_at: OffsetDateTime,
}

impl SessionFacts {
    /// Extract facts from a provider session, using a known payment
    /// record to fill gaps in sparse payloads.
    ///
    /// `completed_at` is the provider-side completion instant (the
    /// webhook event's `created` stamp, or the sync re-query time), so
    /// replays and late syncs do not overwrite the payment time with
    /// the processing time.
    pub fn from_checkout_session(
        session: &CheckoutSession,
        known: Option<&PaymentRecord>,
        completed_at: OffsetDateTime,
    ) -> BillingResult<Self> {
        let meta = |key: &str| -> Option<&str> {
            session
                .metadata
                .as_ref()
                .and_then(|m| m.get(key))
                .map(String::as_str)
        };

        let email = meta(metadata::EMAIL)
            .map(str::to_string)
            .or_else(|| {
                session
                    .customer_details
                    .as_ref()
                    .and_then(|d| d.email.clone())
            })
            .or_else(|| session.customer_email.clone())
            .or_else(|| known.map(|r| r.email.clone()))
            .ok_or_else(|| {
                BillingError::Validation(format!(
                    "session {} carries no customer email",
                    session.id
                ))
            })?;

        let plan_type = meta(metadata::PLAN_TYPE)
            .and_then(|raw| raw.parse().ok())
            .or_else(|| known.map(|r| r.plan_type))
            .ok_or_else(|| {
                BillingError::Validation(format!("session {} carries no plan type", session.id))
            })?;

        let request_id = meta(metadata::REQUEST_ID)
            .map(str::to_string)
            .or_else(|| known.and_then(|r| r.request_id.clone()))
            .or_else(|| session.client_reference_id.clone());

        let payment_intent_id = match &session.payment_intent {
            Some(Expandable::Id(id)) => Some(id.to_string()),
            Some(Expandable::Object(pi)) => Some(pi.id.to_string()),
            None => None,
        };
        let stripe_customer_id = match &session.customer {
            Some(Expandable::Id(id)) => Some(id.to_string()),
            Some(Expandable::Object(c)) => Some(c.id.to_string()),
            None => None,
        };
        let stripe_subscription_id = match &session.subscription {
            Some(Expandable::Id(id)) => Some(id.to_string()),
            Some(Expandable::Object(s)) => Some(s.id.to_string()),
            None => None,
        };

        Ok(Self {
            session_id: session.id.to_string(),
            payment_intent_id,
            email,
            request_id,
            purpose: PaymentPurpose::classify(meta(metadata::PURPOSE), plan_type),
            plan_type,
            amount_cents: session.amount_total.unwrap_or(0),
            quantity: meta(metadata::QUANTITY).and_then(|q| q.parse().ok()),
            stripe_customer_id,
            stripe_subscription_id,
            paid_at: completed_at,
        })
    }
}

/// Facts extracted from an invoice event (renewals, failures)
#[derive(Debug, Clone)]
pub struct InvoiceFacts {
    pub invoice_id: String,
    pub billing_reason: Option<String>,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
}

/// Result of driving a payment through the transition procedure
#[derive(Debug)]
pub enum ReconcileOutcome {
    /// This call won the transition and applied the side effects
    Applied {
        payment: PaymentRecord,
        /// Present when a post-terminal side effect failed
        warning: Option<String>,
    },
    /// The payment was already reconciled; nothing was re-applied
    AlreadyApplied(PaymentRecord),
    /// The provider does not (yet) report this payment as completed
    NotCompleted {
        payment: Option<PaymentRecord>,
        message: String,
    },
}

impl ReconcileOutcome {
    pub fn status_label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "reconciled",
            Self::AlreadyApplied(_) => "already_reconciled",
            Self::NotCompleted { .. } => "pending",
        }
    }

    pub fn payment(&self) -> Option<&PaymentRecord> {
        match self {
            Self::Applied { payment, .. } => Some(payment),
            Self::AlreadyApplied(payment) => Some(payment),
            Self::NotCompleted { payment, .. } => payment.as_ref(),
        }
    }

    pub fn warning(&self) -> Option<&str> {
        match self {
            Self::Applied { warning, .. } => warning.as_deref(),
            _ => None,
        }
    }
}

/// Per-owner sync-all result
#[derive(Debug, Default, serde::Serialize)]
pub struct SyncSummary {
    pub reconciled: Vec<String>,
    pub still_pending: usize,
    pub failures: Vec<String>,
    pub expired_subscriptions: u64,
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    pool: PgPool,
    stripe: StripeClient,
    accounts: AccountService,
    records: PaymentRecordService,
    ledger: CreditLedger,
    catalog: PlanCatalog,
    reports: ReportService,
    managed: ManagedWorkflowService,
    email: PaymentEmailService,
}

impl ReconciliationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        stripe: StripeClient,
        accounts: AccountService,
        records: PaymentRecordService,
        ledger: CreditLedger,
        catalog: PlanCatalog,
        reports: ReportService,
        managed: ManagedWorkflowService,
        email: PaymentEmailService,
    ) -> Self {
        Self {
            pool,
            stripe,
            accounts,
            records,
            ledger,
            catalog,
            reports,
            managed,
            email,
        }
    }

    /// The payment record store the engine drives
    pub fn records(&self) -> &PaymentRecordService {
        &self.records
    }

    /// Drive a provider-confirmed completed session through the
    /// transition procedure. Safe to call any number of times with the
    /// same session: only the first caller applies side effects.
    pub async fn apply_completed_session(
        &self,
        facts: &SessionFacts,
    ) -> BillingResult<ReconcileOutcome> {
        let email = normalize_email(&facts.email);

        let record = match self.find_record_for(facts).await? {
            Some(record) => record,
            None => {
                tracing::warn!(
                    session_id = %facts.session_id,
                    email = %email,
                    "No payment record for completed session, reconstructing from event"
                );
                self.records
                    .reconstruct(
                        &facts.session_id,
                        facts.payment_intent_id.as_deref(),
                        facts.request_id.as_deref(),
                        &email,
                        facts.amount_cents,
                        facts.plan_type,
                    )
                    .await?
            }
        };
        // The record's own session id is the transition key; it matches
        // facts.session_id except when the payment-intent fallback hit.
        let session_key = record.stripe_session_id.clone();

        if record.status == PaymentStatus::Succeeded {
            tracing::info!(
                session_id = %facts.session_id,
                "Payment already reconciled, skipping"
            );
            return Ok(ReconcileOutcome::AlreadyApplied(record));
        }
        if record.status.is_terminal() {
            tracing::error!(
                session_id = %facts.session_id,
                status = %record.status,
                "RECONCILIATION NEEDED: provider reports payment completed but record is terminal"
            );
            return Ok(ReconcileOutcome::AlreadyApplied(record));
        }

        match self
            .records
            .mark_succeeded(&session_key, facts.payment_intent_id.as_deref(), facts.paid_at)
            .await?
        {
            Transition::Applied => {}
            Transition::AlreadyTerminal => {
                // Raced another webhook/sync; the winner applied the effects
                let current = self.current_record(&session_key).await?;
                return Ok(ReconcileOutcome::AlreadyApplied(current));
            }
        }

        tracing::info!(
            session_id = %facts.session_id,
            email = %email,
            plan = %facts.plan_type,
            purpose = ?facts.purpose,
            amount_cents = facts.amount_cents,
            "Payment marked succeeded, applying entitlements"
        );

        let warning = match self.apply_side_effects(facts, &record, &email).await {
            Ok(warning) => warning,
            Err(e) => {
                tracing::error!(
                    session_id = %facts.session_id,
                    email = %email,
                    error = %e,
                    "RECONCILIATION NEEDED: payment succeeded but entitlement application failed"
                );
                Some(format!("entitlement application incomplete: {}", e))
            }
        };

        let payment = self.current_record(&session_key).await?;
        Ok(ReconcileOutcome::Applied { payment, warning })
    }

    /// Locate the record for a completed session: session id first, then
    /// the payment-intent id as the secondary correlation key.
    async fn find_record_for(&self, facts: &SessionFacts) -> BillingResult<Option<PaymentRecord>> {
        if let Some(record) = self.records.find_by_session(&facts.session_id).await? {
            return Ok(Some(record));
        }
        if let Some(intent_id) = facts.payment_intent_id.as_deref() {
            if let Some(record) = self.records.find_by_payment_intent(intent_id).await? {
                tracing::info!(
                    session_id = %facts.session_id,
                    payment_intent_id = %intent_id,
                    record_session_id = %record.stripe_session_id,
                    "Payment record located via payment intent"
                );
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Re-check the latest payment for a request against the provider
    /// and replay the transition when it turns out to be paid.
    pub async fn sync_payment(
        &self,
        request_id: &str,
        email: &str,
    ) -> BillingResult<ReconcileOutcome> {
        let email = normalize_email(email);
        let Some(record) = self
            .records
            .find_latest_for_request(request_id, &email)
            .await?
        else {
            return Ok(ReconcileOutcome::NotCompleted {
                payment: None,
                message: "no payment found for this request".to_string(),
            });
        };

        self.sync_record(record).await
    }

    /// Replay sync for every pending payment an owner has, after
    /// sweeping lapsed subscriptions for derived-state repair.
    pub async fn sync_all(&self, email: &str) -> BillingResult<SyncSummary> {
        let email = normalize_email(email);
        let mut summary = SyncSummary {
            expired_subscriptions: self.accounts.expire_lapsed(&email).await?,
            ..SyncSummary::default()
        };
        if summary.expired_subscriptions > 0 {
            tracing::info!(
                email = %email,
                count = summary.expired_subscriptions,
                "Expired lapsed subscriptions during sync"
            );
        }

        for record in self.records.pending_for_email(&email).await? {
            let session_id = record.stripe_session_id.clone();
            match self.sync_record(record).await {
                Ok(ReconcileOutcome::Applied { .. }) => summary.reconciled.push(session_id),
                Ok(ReconcileOutcome::AlreadyApplied(_)) => summary.reconciled.push(session_id),
                Ok(ReconcileOutcome::NotCompleted { .. }) => summary.still_pending += 1,
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Sync failed for session");
                    summary.failures.push(format!("{}: {}", session_id, e));
                }
            }
        }

        Ok(summary)
    }

    async fn sync_record(&self, record: PaymentRecord) -> BillingResult<ReconcileOutcome> {
        if record.status == PaymentStatus::Succeeded {
            return Ok(ReconcileOutcome::AlreadyApplied(record));
        }
        if record.status.is_terminal() {
            let message = format!("payment is {}", record.status);
            return Ok(ReconcileOutcome::NotCompleted {
                payment: Some(record),
                message,
            });
        }

        let session_id: stripe::CheckoutSessionId =
            record.stripe_session_id.parse().map_err(|_| {
                BillingError::Internal(format!(
                    "stored session id {} is not a valid provider id",
                    record.stripe_session_id
                ))
            })?;

        let session = CheckoutSession::retrieve(self.stripe.inner(), &session_id, &[])
            .await
            .map_err(|e| {
                tracing::warn!(session_id = %session_id, error = %e, "Provider session lookup failed");
                BillingError::ProviderUnavailable("payment provider lookup failed".to_string())
            })?;

        match session.payment_status {
            CheckoutSessionPaymentStatus::Paid
            | CheckoutSessionPaymentStatus::NoPaymentRequired => {
                let facts = SessionFacts::from_checkout_session(
                    &session,
                    Some(&record),
                    OffsetDateTime::now_utc(),
                )?;
                self.apply_completed_session(&facts).await
            }
            CheckoutSessionPaymentStatus::Unpaid => {
                if session.status == Some(CheckoutSessionStatus::Expired) {
                    self.records
                        .mark_terminal(&record.stripe_session_id, PaymentStatus::Canceled)
                        .await?;
                    let payment = self.current_record(&record.stripe_session_id).await?;
                    Ok(ReconcileOutcome::NotCompleted {
                        payment: Some(payment),
                        message: "checkout session expired without payment".to_string(),
                    })
                } else {
                    // Persist the intent id once the provider exposes it,
                    // so later events can correlate on the secondary key
                    if record.stripe_payment_intent_id.is_none() {
                        if let Some(Expandable::Id(intent_id)) = &session.payment_intent {
                            self.records
                                .enrich_payment_intent(
                                    &record.stripe_session_id,
                                    intent_id.as_str(),
                                )
                                .await?;
                        }
                    }
                    Ok(ReconcileOutcome::NotCompleted {
                        payment: Some(record),
                        message: "payment not completed yet".to_string(),
                    })
                }
            }
        }
    }

    async fn apply_side_effects(
        &self,
        facts: &SessionFacts,
        record: &PaymentRecord,
        email: &str,
    ) -> BillingResult<Option<String>> {
        match facts.purpose {
            PaymentPurpose::ManagedFee => self.apply_managed_fee(facts, email, false).await,
            PaymentPurpose::ManagedSavings => self.apply_managed_fee(facts, email, true).await,
            PaymentPurpose::CreditTopup => self.apply_topup(facts, record, email).await,
            PaymentPurpose::Standard => {
                if facts.plan_type.is_recurring() {
                    self.apply_subscription(facts, record, email).await
                } else {
                    self.apply_report_unlock(facts, record, email).await
                }
            }
        }
    }

    /// Managed fees are audit-only: flip the paid flag, advance the
    /// workflow, touch no credits or entitlements.
    async fn apply_managed_fee(
        &self,
        facts: &SessionFacts,
        email: &str,
        savings: bool,
    ) -> BillingResult<Option<String>> {
        let Some(request_id) = facts.request_id.as_deref() else {
            tracing::error!(
                session_id = %facts.session_id,
                "Managed fee payment without a request id, nothing to advance"
            );
            return Ok(Some("managed fee payment carried no request id".to_string()));
        };

        let applied = if savings {
            self.managed.mark_savings_fee_paid(request_id, email).await?
        } else {
            self.managed.mark_fee_paid(request_id, email).await?
        };
        if !applied {
            tracing::info!(request_id = %request_id, "Managed fee already recorded, skipping");
        }
        Ok(None)
    }

    /// Credit top-up: add the purchased credits, and when the purchase
    /// was made from a specific request, immediately consume one to
    /// unlock that report. Two distinct ledger entries, one transaction.
    async fn apply_topup(
        &self,
        facts: &SessionFacts,
        record: &PaymentRecord,
        email: &str,
    ) -> BillingResult<Option<String>> {
        let account = self.accounts.find_or_create(email).await?;
        let quantity = derive_topup_quantity(
            facts.quantity,
            facts.amount_cents,
            self.stripe.config().credit_unit_price_cents,
        );

        let mut tx = self.pool.begin().await?;
        self.ledger
            .record(
                &mut tx,
                account.id,
                quantity,
                TransactionType::Added,
                TransactionReason::TopUp,
                facts.request_id.as_deref(),
                None,
            )
            .await?;
        if let Some(request_id) = facts.request_id.as_deref() {
            self.ledger
                .record(
                    &mut tx,
                    account.id,
                    -1,
                    TransactionType::Deducted,
                    TransactionReason::UnlockRequest,
                    Some(request_id),
                    None,
                )
                .await?;
        }
        tx.commit().await?;

        let mut warning = None;
        if let Some(request_id) = facts.request_id.as_deref() {
            if let Err(e) = self.reports.unlock(request_id, Some(record.id)).await {
                tracing::error!(
                    request_id = %request_id,
                    error = %e,
                    "RECONCILIATION NEEDED: top-up credited but report unlock failed"
                );
                warning = Some(format!("report unlock failed: {}", e));
            } else {
                self.trigger_generation(request_id).await;
                self.email.send_payment_confirmation(email, request_id).await;
            }
        }
        Ok(warning)
    }

    /// One-time report unlock purchase
    async fn apply_report_unlock(
        &self,
        facts: &SessionFacts,
        record: &PaymentRecord,
        email: &str,
    ) -> BillingResult<Option<String>> {
        // First successful payment creates the account
        self.accounts.find_or_create(email).await?;

        let Some(request_id) = facts.request_id.as_deref() else {
            tracing::error!(
                session_id = %facts.session_id,
                "Report unlock payment without a request id"
            );
            return Ok(Some("report unlock payment carried no request id".to_string()));
        };

        self.reports.unlock(request_id, Some(record.id)).await?;
        self.trigger_generation(request_id).await;
        self.email.send_payment_confirmation(email, request_id).await;
        Ok(None)
    }

    /// Subscription purchase: resolve the allocation, write the ledger
    /// entries, activate the subscription, notify. A purchase made from
    /// a specific request also opens that report, with no credit
    /// consumed; the subscription price covers it.
    async fn apply_subscription(
        &self,
        facts: &SessionFacts,
        record: &PaymentRecord,
        email: &str,
    ) -> BillingResult<Option<String>> {
        let account = self.accounts.find_or_create(email).await?;
        let credits = self.catalog.credits_for(facts.plan_type).await;
        let allocation =
            resolve_allocation(facts.plan_type, credits, account.credit_balance, facts.paid_at);

        self.record_allocation(
            &account,
            credits.credits_granted,
            allocation,
            facts.request_id.as_deref(),
        )
        .await?;

        self.accounts
            .activate_subscription(
                account.id,
                facts.plan_type,
                allocation.new_expiry,
                facts.stripe_customer_id.as_deref(),
                facts.stripe_subscription_id.as_deref(),
            )
            .await?;

        self.email
            .send_subscription_activated(email, facts.plan_type.family(), credits.credits_granted)
            .await;

        if let Some(request_id) = facts.request_id.as_deref() {
            if let Err(e) = self.reports.unlock(request_id, Some(record.id)).await {
                tracing::error!(
                    request_id = %request_id,
                    error = %e,
                    "RECONCILIATION NEEDED: subscription activated but report unlock failed"
                );
                return Ok(Some(format!("report unlock failed: {}", e)));
            }
            self.trigger_generation(request_id).await;
            self.email.send_payment_confirmation(email, request_id).await;
        }
        Ok(None)
    }

    /// Write the ledger entries an allocation implies: a forfeiture
    /// entry when the old balance exceeds what rolls over, then the
    /// period grant. Committed together.
    async fn record_allocation(
        &self,
        account: &Account,
        granted: i64,
        allocation: Allocation,
        correlation_id: Option<&str>,
    ) -> BillingResult<()> {
        let forfeited = forfeited_credits(account.credit_balance, granted, allocation.new_balance);

        let mut tx = self.pool.begin().await?;
        if forfeited > 0 {
            self.ledger
                .record(
                    &mut tx,
                    account.id,
                    -forfeited,
                    TransactionType::Expired,
                    TransactionReason::Rollover,
                    correlation_id,
                    None,
                )
                .await?;
        }
        if granted > 0 {
            self.ledger
                .record(
                    &mut tx,
                    account.id,
                    granted,
                    TransactionType::Added,
                    TransactionReason::SubscriptionAllocation,
                    correlation_id,
                    None,
                )
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Best-effort generation trigger; a scorer failure leaves the
    /// report unlocked and is never escalated.
    async fn trigger_generation(&self, request_id: &str) {
        if let Err(e) = self.reports.generate(request_id).await {
            tracing::warn!(
                request_id = %request_id,
                error = %e,
                "Report generation failed after unlock, report stays unlocked"
            );
        }
    }

    /// Subscription canceled at the provider: downgrade the account.
    pub async fn handle_subscription_deleted(
        &self,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
    ) -> BillingResult<()> {
        let account = match customer_id {
            Some(id) => self.accounts.find_by_stripe_customer(id).await?,
            None => None,
        };
        let Some(account) = account else {
            tracing::warn!(
                customer_id = ?customer_id,
                "Subscription deleted for unknown customer, ignoring"
            );
            return Ok(());
        };

        if let (Some(deleted), Some(stored)) = (subscription_id, &account.stripe_subscription_id) {
            if deleted != stored {
                tracing::info!(
                    account_id = %account.id,
                    deleted = %deleted,
                    "Deleted subscription does not match the active one, ignoring"
                );
                return Ok(());
            }
        }

        self.accounts
            .set_subscription_status(account.id, SubscriptionStatus::Canceled)
            .await?;
        tracing::info!(account_id = %account.id, email = %account.email, "Subscription canceled");
        Ok(())
    }

    /// Renewal invoice paid: run the same allocation path as the
    /// original purchase, once per invoice.
    pub async fn handle_invoice_paid(&self, facts: &InvoiceFacts) -> BillingResult<()> {
        if facts.billing_reason.as_deref() != Some("subscription_cycle") {
            tracing::debug!(
                invoice_id = %facts.invoice_id,
                billing_reason = ?facts.billing_reason,
                "Invoice is not a renewal, skipping"
            );
            return Ok(());
        }

        let account = match facts.customer_id.as_deref() {
            Some(id) => self.accounts.find_by_stripe_customer(id).await?,
            None => None,
        };
        let Some(account) = account else {
            tracing::warn!(invoice_id = %facts.invoice_id, "Renewal invoice for unknown customer");
            return Ok(());
        };
        let Some(plan) = account.subscription_plan.filter(|p| p.is_recurring()) else {
            tracing::warn!(
                account_id = %account.id,
                invoice_id = %facts.invoice_id,
                "Renewal invoice for an account without a recurring plan"
            );
            return Ok(());
        };

        // One allocation per invoice, however many events carry it
        let already: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM credit_transactions
            WHERE request_id = $1 AND reason = 'subscription_allocation'
            LIMIT 1
            "#,
        )
        .bind(&facts.invoice_id)
        .fetch_optional(&self.pool)
        .await?;
        if already.is_some() {
            tracing::info!(invoice_id = %facts.invoice_id, "Renewal already allocated, skipping");
            return Ok(());
        }

        let credits = self.catalog.credits_for(plan).await;
        let now = OffsetDateTime::now_utc();
        let allocation = resolve_allocation(plan, credits, account.credit_balance, now);

        self.record_allocation(
            &account,
            credits.credits_granted,
            allocation,
            Some(&facts.invoice_id),
        )
        .await?;
        self.accounts
            .activate_subscription(
                account.id,
                plan,
                allocation.new_expiry,
                facts.customer_id.as_deref(),
                facts.subscription_id.as_deref(),
            )
            .await?;

        tracing::info!(
            account_id = %account.id,
            invoice_id = %facts.invoice_id,
            plan = %plan,
            granted = credits.credits_granted,
            "Renewal allocated"
        );
        Ok(())
    }

    /// Renewal payment failed: expire the subscription once it is
    /// actually past its paid-through date, and tell the owner.
    pub async fn handle_invoice_payment_failed(
        &self,
        customer_id: Option<&str>,
    ) -> BillingResult<()> {
        let account = match customer_id {
            Some(id) => self.accounts.find_by_stripe_customer(id).await?,
            None => None,
        };
        let Some(account) = account else {
            tracing::warn!(customer_id = ?customer_id, "Payment failure for unknown customer");
            return Ok(());
        };

        let now = OffsetDateTime::now_utc();
        if account.subscription_status == SubscriptionStatus::Active
            && !account.has_active_subscription(now)
        {
            self.accounts
                .set_subscription_status(account.id, SubscriptionStatus::Expired)
                .await?;
            tracing::warn!(
                account_id = %account.id,
                email = %account.email,
                "Subscription expired after failed renewal payment"
            );
        }

        self.email.send_payment_failed(&account.email).await;
        Ok(())
    }

    async fn current_record(&self, session_id: &str) -> BillingResult<PaymentRecord> {
        self.records
            .find_by_session(session_id)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!("payment record vanished for session {}", session_id))
            })
    }
}

/// Credits a top-up grants: explicit metadata quantity first, otherwise
/// derived from the amount paid, never less than one.
pub fn derive_topup_quantity(quantity: Option<i64>, amount_cents: i64, unit_price_cents: i64) -> i64 {
    if let Some(q) = quantity {
        if q > 0 {
            return q;
        }
    }
    if unit_price_cents > 0 && amount_cents > 0 {
        return (amount_cents / unit_price_cents).max(1);
    }
    1
}

/// Credits forfeited by an allocation: whatever the old balance held
/// beyond what the plan rolls over.
pub fn forfeited_credits(current_balance: i64, granted: i64, new_balance: i64) -> i64 {
    let rolled_over = new_balance - granted;
    (current_balance - rolled_over).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_purpose_classification_from_metadata() {
        assert_eq!(
            PaymentPurpose::classify(Some("credit_topup"), PlanType::ReportUnlock),
            PaymentPurpose::CreditTopup
        );
        assert_eq!(
            PaymentPurpose::classify(Some("managed_service_fee"), PlanType::ReportUnlock),
            PaymentPurpose::ManagedFee
        );
        assert_eq!(
            PaymentPurpose::classify(Some("managed_savings_fee"), PlanType::ReportUnlock),
            PaymentPurpose::ManagedSavings
        );
        assert_eq!(
            PaymentPurpose::classify(Some("standard"), PlanType::CreditTopup),
            PaymentPurpose::Standard
        );
        // Unknown purposes fall through to standard handling
        assert_eq!(
            PaymentPurpose::classify(Some("gift"), PlanType::StarterMonthly),
            PaymentPurpose::Standard
        );
    }

    #[test]
    fn test_purpose_classification_falls_back_to_plan() {
        assert_eq!(
            PaymentPurpose::classify(None, PlanType::CreditTopup),
            PaymentPurpose::CreditTopup
        );
        assert_eq!(
            PaymentPurpose::classify(None, PlanType::ManagedServiceFee),
            PaymentPurpose::ManagedFee
        );
        assert_eq!(
            PaymentPurpose::classify(None, PlanType::ManagedSavingsFee),
            PaymentPurpose::ManagedSavings
        );
        assert_eq!(
            PaymentPurpose::classify(None, PlanType::ProfessionalAnnual),
            PaymentPurpose::Standard
        );
    }

    #[test]
    fn test_topup_quantity_prefers_metadata() {
        assert_eq!(derive_topup_quantity(Some(5), 10_000, 1000), 5);
        // Non-positive metadata falls back to the amount
        assert_eq!(derive_topup_quantity(Some(0), 10_000, 1000), 10);
    }

    #[test]
    fn test_topup_quantity_derived_from_amount() {
        assert_eq!(derive_topup_quantity(None, 10_000, 1000), 10);
        assert_eq!(derive_topup_quantity(None, 1500, 1000), 1);
        assert_eq!(derive_topup_quantity(None, 999, 1000), 1);
    }

    #[test]
    fn test_topup_quantity_floor_is_one() {
        assert_eq!(derive_topup_quantity(None, 0, 1000), 1);
        assert_eq!(derive_topup_quantity(None, 5000, 0), 1);
    }

    #[test]
    fn test_forfeited_credits() {
        // Balance 5, professional renewal keeps 3: 2 forfeited
        assert_eq!(forfeited_credits(5, 15, 18), 2);
        // Everything rolls over
        assert_eq!(forfeited_credits(2, 15, 17), 0);
        // No rollover plan: the whole balance is forfeited
        assert_eq!(forfeited_credits(4, 5, 5), 4);
        // Empty balance forfeits nothing
        assert_eq!(forfeited_credits(0, 15, 15), 0);
    }

    #[test]
    fn test_outcome_labels() {
        let outcome = ReconcileOutcome::NotCompleted {
            payment: None,
            message: "no payment found".to_string(),
        };
        assert_eq!(outcome.status_label(), "pending");
        assert!(outcome.payment().is_none());
        assert!(outcome.warning().is_none());
    }
}
