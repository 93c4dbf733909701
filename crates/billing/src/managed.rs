//! Managed sourcing workflow state
//!
//! Managed engagements are invoiced outside the credit system: the
//! service fee and the later savings fee each produce an audit-only
//! payment record and flip a paid flag here. No credits, no
//! entitlement. Stage advancement is conditional so replayed webhooks
//! cannot advance a workflow twice.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Workflow stages a managed engagement moves through
pub const STAGE_AWAITING_FEE: &str = "awaiting_fee";
pub const STAGE_SOURCING: &str = "sourcing";
pub const STAGE_SAVINGS_REVIEW: &str = "savings_review";
pub const STAGE_CLOSED: &str = "closed";

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct ManagedService {
    pub id: Uuid,
    pub request_id: String,
    pub email: String,
    pub fee_paid: bool,
    pub fee_paid_at: Option<OffsetDateTime>,
    pub savings_fee_paid: bool,
    pub savings_fee_paid_at: Option<OffsetDateTime>,
    pub workflow_stage: String,
    pub created_at: OffsetDateTime,
}

#[derive(Clone)]
pub struct ManagedWorkflowService {
    pool: PgPool,
}

impl ManagedWorkflowService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_request(&self, request_id: &str) -> BillingResult<Option<ManagedService>> {
        let row = sqlx::query_as::<_, ManagedService>(
            r#"
            SELECT id, request_id, email, fee_paid, fee_paid_at,
                   savings_fee_paid, savings_fee_paid_at, workflow_stage, created_at
            FROM managed_services
            WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Ensure a workflow row exists for a request. A fee payment can
    /// arrive before the engagement was registered.
    pub async fn ensure(&self, request_id: &str, email: &str) -> BillingResult<ManagedService> {
        sqlx::query(
            r#"
            INSERT INTO managed_services (request_id, email, workflow_stage)
            VALUES ($1, $2, $3)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(request_id)
        .bind(email)
        .bind(STAGE_AWAITING_FEE)
        .execute(&self.pool)
        .await?;

        self.find_by_request(request_id).await?.ok_or_else(|| {
            BillingError::Internal(format!("managed workflow upsert lost for {}", request_id))
        })
    }

    /// Record the upfront service fee as paid and advance
    /// `awaiting_fee -> sourcing`. Returns false when the fee was
    /// already recorded (replay).
    pub async fn mark_fee_paid(&self, request_id: &str, email: &str) -> BillingResult<bool> {
        self.ensure(request_id, email).await?;

        let applied: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE managed_services
            SET fee_paid = TRUE,
                fee_paid_at = NOW(),
                workflow_stage = $2,
                updated_at = NOW()
            WHERE request_id = $1 AND fee_paid = FALSE
            RETURNING id
            "#,
        )
        .bind(request_id)
        .bind(STAGE_SOURCING)
        .fetch_optional(&self.pool)
        .await?;

        if applied.is_some() {
            tracing::info!(request_id = %request_id, "Managed service fee recorded, sourcing started");
        }
        Ok(applied.is_some())
    }

    /// Record the savings fee as paid and close the engagement.
    pub async fn mark_savings_fee_paid(
        &self,
        request_id: &str,
        email: &str,
    ) -> BillingResult<bool> {
        self.ensure(request_id, email).await?;

        let applied: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE managed_services
            SET savings_fee_paid = TRUE,
                savings_fee_paid_at = NOW(),
                workflow_stage = $2,
                updated_at = NOW()
            WHERE request_id = $1 AND savings_fee_paid = FALSE
            RETURNING id
            "#,
        )
        .bind(request_id)
        .bind(STAGE_CLOSED)
        .fetch_optional(&self.pool)
        .await?;

        if applied.is_some() {
            tracing::info!(request_id = %request_id, "Managed savings fee recorded, engagement closed");
        }
        Ok(applied.is_some())
    }

    /// Move a sourcing engagement into savings review once the supplier
    /// switch is confirmed. Operator-driven, not payment-driven.
    pub async fn begin_savings_review(&self, request_id: &str) -> BillingResult<bool> {
        let applied: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE managed_services
            SET workflow_stage = $2, updated_at = NOW()
            WHERE request_id = $1 AND workflow_stage = $3
            RETURNING id
            "#,
        )
        .bind(request_id)
        .bind(STAGE_SAVINGS_REVIEW)
        .bind(STAGE_SOURCING)
        .fetch_optional(&self.pool)
        .await?;
        Ok(applied.is_some())
    }
}
