//! Payment record store
//!
//! One durable record per checkout attempt, keyed by the Stripe checkout
//! session id. Terminal transitions happen exactly once via conditional
//! updates (`WHERE status = 'pending'`), which is what makes replayed
//! webhooks and racing sync calls safe without a distributed lock.

use sqlx::PgPool;
use supplymatch_shared::{PaymentStatus, PlanType};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, serde::Serialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub stripe_session_id: String,
    pub stripe_payment_intent_id: Option<String>,
    /// Business correlation id; absent for standalone credit top-ups
    pub request_id: Option<String>,
    pub email: String,
    pub amount_cents: i64,
    pub plan_type: PlanType,
    pub status: PaymentStatus,
    pub paid_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Outcome of a conditional terminal transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// This caller won the transition; side effects should be applied
    Applied,
    /// The record was already terminal; side effects must be skipped
    AlreadyTerminal,
}

#[derive(Clone)]
pub struct PaymentRecordService {
    pool: PgPool,
}

impl PaymentRecordService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a pending record at checkout-session creation time
    pub async fn create_pending(
        &self,
        stripe_session_id: &str,
        request_id: Option<&str>,
        email: &str,
        amount_cents: i64,
        plan_type: PlanType,
    ) -> BillingResult<PaymentRecord> {
        let row: PaymentRow = sqlx::query_as(
            r#"
            INSERT INTO payment_records
                (stripe_session_id, request_id, email, amount_cents, plan_type, status)
            VALUES ($1, $2, $3, $4, $5, 'pending')
            ON CONFLICT (stripe_session_id) DO UPDATE SET updated_at = NOW()
            RETURNING id, stripe_session_id, stripe_payment_intent_id, request_id, email,
                      amount_cents, plan_type, status, paid_at, created_at
            "#,
        )
        .bind(stripe_session_id)
        .bind(request_id)
        .bind(email)
        .bind(amount_cents)
        .bind(plan_type.as_str())
        .fetch_one(&self.pool)
        .await?;

        row.into_record()
    }

    /// Reconstruct a record from a provider event when checkout-session
    /// creation never persisted one. Safe against concurrent
    /// reconstruction: the conflict arm leaves the existing row alone.
    pub async fn reconstruct(
        &self,
        stripe_session_id: &str,
        stripe_payment_intent_id: Option<&str>,
        request_id: Option<&str>,
        email: &str,
        amount_cents: i64,
        plan_type: PlanType,
    ) -> BillingResult<PaymentRecord> {
        sqlx::query(
            r#"
            INSERT INTO payment_records
                (stripe_session_id, stripe_payment_intent_id, request_id, email,
                 amount_cents, plan_type, status)
            VALUES ($1, $2, $3, $4, $5, $6, 'pending')
            ON CONFLICT (stripe_session_id) DO NOTHING
            "#,
        )
        .bind(stripe_session_id)
        .bind(stripe_payment_intent_id)
        .bind(request_id)
        .bind(email)
        .bind(amount_cents)
        .bind(plan_type.as_str())
        .execute(&self.pool)
        .await?;

        self.find_by_session(stripe_session_id)
            .await?
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "payment record upsert lost for session {}",
                    stripe_session_id
                ))
            })
    }

    pub async fn find_by_session(&self, session_id: &str) -> BillingResult<Option<PaymentRecord>> {
        let row: Option<PaymentRow> = sqlx::query_as(
            r#"
            SELECT id, stripe_session_id, stripe_payment_intent_id, request_id, email,
                   amount_cents, plan_type, status, paid_at, created_at
            FROM payment_records
            WHERE stripe_session_id = $1
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PaymentRow::into_record).transpose()
    }

    pub async fn find_by_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<Option<PaymentRecord>> {
        let row: Option<PaymentRow> = sqlx::query_as(
            r#"
            SELECT id, stripe_session_id, stripe_payment_intent_id, request_id, email,
                   amount_cents, plan_type, status, paid_at, created_at
            FROM payment_records
            WHERE stripe_payment_intent_id = $1
            "#,
        )
        .bind(payment_intent_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PaymentRow::into_record).transpose()
    }

    /// Latest record for a business request, newest first
    pub async fn find_latest_for_request(
        &self,
        request_id: &str,
        email: &str,
    ) -> BillingResult<Option<PaymentRecord>> {
        let row: Option<PaymentRow> = sqlx::query_as(
            r#"
            SELECT id, stripe_session_id, stripe_payment_intent_id, request_id, email,
                   amount_cents, plan_type, status, paid_at, created_at
            FROM payment_records
            WHERE request_id = $1 AND email = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(request_id)
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PaymentRow::into_record).transpose()
    }

    /// All records still pending for an owner (sync-all input)
    pub async fn pending_for_email(&self, email: &str) -> BillingResult<Vec<PaymentRecord>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(
            r#"
            SELECT id, stripe_session_id, stripe_payment_intent_id, request_id, email,
                   amount_cents, plan_type, status, paid_at, created_at
            FROM payment_records
            WHERE email = $1 AND status = 'pending'
            ORDER BY created_at ASC
            "#,
        )
        .bind(email)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PaymentRow::into_record).collect()
    }

    /// Atomically transition a pending record to `succeeded`.
    ///
    /// Only one caller ever observes [`Transition::Applied`] for a given
    /// session: the conditional update is the idempotency gate every
    /// sub-handler relies on before applying credit/entitlement effects.
    pub async fn mark_succeeded(
        &self,
        session_id: &str,
        payment_intent_id: Option<&str>,
        paid_at: OffsetDateTime,
    ) -> BillingResult<Transition> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE payment_records
            SET status = 'succeeded',
                paid_at = $2,
                stripe_payment_intent_id = COALESCE($3, stripe_payment_intent_id),
                updated_at = NOW()
            WHERE stripe_session_id = $1 AND status = 'pending'
            RETURNING id
            "#,
        )
        .bind(session_id)
        .bind(paid_at)
        .bind(payment_intent_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(if claimed.is_some() {
            Transition::Applied
        } else {
            Transition::AlreadyTerminal
        })
    }

    /// Transition a pending record to `failed` or `canceled`
    pub async fn mark_terminal(
        &self,
        session_id: &str,
        status: PaymentStatus,
    ) -> BillingResult<Transition> {
        if !status.is_terminal() || status == PaymentStatus::Succeeded {
            return Err(BillingError::Internal(format!(
                "mark_terminal called with {}",
                status
            )));
        }

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE payment_records
            SET status = $2, updated_at = NOW()
            WHERE stripe_session_id = $1 AND status = 'pending'
            RETURNING id
            "#,
        )
        .bind(session_id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(if claimed.is_some() {
            Transition::Applied
        } else {
            Transition::AlreadyTerminal
        })
    }

    /// Enrich provider ids on a record; allowed even after terminal status
    pub async fn enrich_payment_intent(
        &self,
        session_id: &str,
        payment_intent_id: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE payment_records
            SET stripe_payment_intent_id = $2, updated_at = NOW()
            WHERE stripe_session_id = $1 AND stripe_payment_intent_id IS NULL
            "#,
        )
        .bind(session_id)
        .bind(payment_intent_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    stripe_session_id: String,
    stripe_payment_intent_id: Option<String>,
    request_id: Option<String>,
    email: String,
    amount_cents: i64,
    plan_type: String,
    status: String,
    paid_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl PaymentRow {
    fn into_record(self) -> BillingResult<PaymentRecord> {
        Ok(PaymentRecord {
            id: self.id,
            stripe_session_id: self.stripe_session_id,
            stripe_payment_intent_id: self.stripe_payment_intent_id,
            request_id: self.request_id,
            email: self.email,
            amount_cents: self.amount_cents,
            plan_type: self
                .plan_type
                .parse()
                .map_err(|e| BillingError::Internal(format!("corrupt payment row: {}", e)))?,
            status: self
                .status
                .parse()
                .map_err(|e| BillingError::Internal(format!("corrupt payment row: {}", e)))?,
            paid_at: self.paid_at,
            created_at: self.created_at,
        })
    }
}
