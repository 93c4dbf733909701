//! Match report unlock gate
//!
//! Two-step reveal for buyer match reports: `pending` (no entitlement
//! consumed) -> `unlocked` (payment/credit applied, matching not yet
//! run) -> `completed` (scored supplier detail present). Full contact
//! detail is additionally gated by an access check that is orthogonal
//! to the status: a valid email-bound token or the owner.

use sqlx::PgPool;
use std::sync::Arc;
use supplymatch_shared::{ReportStatus, TransactionReason, TransactionType};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::accounts::{normalize_email, Account};
use crate::error::{BillingError, BillingResult};
use crate::ledger::CreditLedger;
use crate::tokens::{AccessTokenService, TokenType};

/// How many scored suppliers a completed report keeps
const TOP_N_CANDIDATES: usize = 10;

/// Scoring result from the external matcher
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MatchScore {
    /// 0..=100
    pub score: i32,
    pub factors: Vec<String>,
    pub explanation: String,
}

/// Supplier row the matcher scores against
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, sqlx::FromRow)]
pub struct Supplier {
    pub id: Uuid,
    pub name: String,
    pub category: String,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub website: Option<String>,
}

/// The request projection the matcher sees
#[derive(Debug, Clone)]
pub struct MatchRequestSummary {
    pub request_id: String,
    pub email: String,
    pub summary: String,
    pub category: String,
}

/// External matching collaborator. Failure of this interface never
/// fails a payment transition; it only gates `unlocked -> completed`.
pub trait MatchScorer: Send + Sync {
    fn score(&self, request: &MatchRequestSummary, supplier: &Supplier)
        -> BillingResult<MatchScore>;
}

/// One scored candidate in a completed report
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ScoredSupplier {
    pub supplier: Supplier,
    pub score: i32,
    pub factors: Vec<String>,
    pub explanation: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MatchReport {
    pub id: Uuid,
    pub request_id: String,
    pub email: String,
    pub status: ReportStatus,
    pub summary: String,
    pub category: String,
    pub average_score: Option<f64>,
    pub candidates: Vec<ScoredSupplier>,
    /// Back-reference to the payment that unlocked this report, for audit
    pub payment_record_id: Option<Uuid>,
    pub unlocked_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Preview projection safe to show before entitlement is consumed
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReportPreview {
    pub request_id: String,
    pub status: ReportStatus,
    pub summary: String,
    pub category: String,
    pub average_score: Option<f64>,
    pub candidate_count: usize,
}

impl MatchReport {
    pub fn preview(&self) -> ReportPreview {
        ReportPreview {
            request_id: self.request_id.clone(),
            status: self.status,
            summary: self.summary.clone(),
            category: self.category.clone(),
            average_score: self.average_score,
            candidate_count: self.candidates.len(),
        }
    }
}

#[derive(Clone)]
pub struct ReportService {
    pool: PgPool,
    ledger: CreditLedger,
    tokens: AccessTokenService,
    scorer: Arc<dyn MatchScorer>,
}

impl ReportService {
    pub fn new(
        pool: PgPool,
        ledger: CreditLedger,
        tokens: AccessTokenService,
        scorer: Arc<dyn MatchScorer>,
    ) -> Self {
        Self {
            pool,
            ledger,
            tokens,
            scorer,
        }
    }

    pub async fn find_by_request(&self, request_id: &str) -> BillingResult<Option<MatchReport>> {
        let row: Option<ReportRow> = sqlx::query_as(
            r#"
            SELECT id, request_id, email, status, summary, category, average_score,
                   candidates, payment_record_id, unlocked_at, completed_at, created_at
            FROM match_reports
            WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ReportRow::into_report).transpose()
    }

    /// Flip `pending -> unlocked`. Idempotent: an already unlocked or
    /// completed report is left as-is and reported as not-applied.
    pub async fn unlock(
        &self,
        request_id: &str,
        payment_record_id: Option<Uuid>,
    ) -> BillingResult<bool> {
        let applied: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE match_reports
            SET status = 'unlocked',
                unlocked_at = NOW(),
                payment_record_id = COALESCE($2, payment_record_id),
                updated_at = NOW()
            WHERE request_id = $1 AND status = 'pending'
            RETURNING id
            "#,
        )
        .bind(request_id)
        .bind(payment_record_id)
        .fetch_optional(&self.pool)
        .await?;

        if applied.is_some() {
            tracing::info!(request_id = %request_id, "Match report unlocked");
        }
        Ok(applied.is_some())
    }

    /// Run the matcher over all active suppliers and complete the report.
    ///
    /// Requires the report to already be unlocked (or completed, for
    /// regeneration). Individual supplier scoring failures are skipped
    /// with a warning; an empty result still completes the report.
    pub async fn generate(&self, request_id: &str) -> BillingResult<MatchReport> {
        let report = self
            .find_by_request(request_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("report for request {}", request_id)))?;

        if !report.status.is_unlocked() {
            return Err(BillingError::Validation(
                "report is not unlocked; payment or credit required".to_string(),
            ));
        }

        let request = MatchRequestSummary {
            request_id: report.request_id.clone(),
            email: report.email.clone(),
            summary: report.summary.clone(),
            category: report.category.clone(),
        };

        let suppliers: Vec<Supplier> = sqlx::query_as(
            r#"
            SELECT id, name, category, contact_email, contact_phone, website
            FROM suppliers
            WHERE is_active = TRUE
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut scored = Vec::with_capacity(suppliers.len());
        for supplier in suppliers {
            match self.scorer.score(&request, &supplier) {
                Ok(score) => scored.push(ScoredSupplier {
                    score: score.score.clamp(0, 100),
                    factors: score.factors,
                    explanation: score.explanation,
                    supplier,
                }),
                Err(e) => {
                    tracing::warn!(
                        request_id = %request_id,
                        supplier_id = %supplier.id,
                        error = %e,
                        "Supplier scoring failed, skipping candidate"
                    );
                }
            }
        }

        scored.sort_by(|a, b| b.score.cmp(&a.score));
        scored.truncate(TOP_N_CANDIDATES);

        let average_score = if scored.is_empty() {
            None
        } else {
            Some(scored.iter().map(|s| s.score as f64).sum::<f64>() / scored.len() as f64)
        };

        let candidates_json = serde_json::to_value(&scored)
            .map_err(|e| BillingError::Internal(format!("candidate serialization: {}", e)))?;

        sqlx::query(
            r#"
            UPDATE match_reports
            SET status = 'completed',
                candidates = $2,
                average_score = $3,
                completed_at = NOW(),
                updated_at = NOW()
            WHERE request_id = $1
            "#,
        )
        .bind(request_id)
        .bind(candidates_json)
        .bind(average_score)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            request_id = %request_id,
            candidates = scored.len(),
            average_score = ?average_score,
            "Match report completed"
        );

        self.find_by_request(request_id)
            .await?
            .ok_or_else(|| BillingError::Internal("report vanished after generation".to_string()))
    }

    /// Generate on behalf of an entitled subscriber.
    ///
    /// A still-pending report consumes one credit (`deducted` /
    /// `match_generation`) before unlocking; an already unlocked report
    /// is regenerated without further consumption.
    pub async fn generate_for_account(
        &self,
        account: &Account,
        request_id: &str,
    ) -> BillingResult<MatchReport> {
        let report = self
            .find_by_request(request_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("report for request {}", request_id)))?;

        if !normalize_email(&report.email).eq_ignore_ascii_case(&account.email) {
            return Err(BillingError::Validation(
                "report does not belong to this account".to_string(),
            ));
        }

        if report.status == ReportStatus::Pending {
            // Deduction and unlock commit together; if the unlock loses a
            // race the deduction rolls back with it and nothing is spent
            let mut tx = self.pool.begin().await?;
            self.ledger
                .record(
                    &mut tx,
                    account.id,
                    -1,
                    TransactionType::Deducted,
                    TransactionReason::MatchGeneration,
                    Some(request_id),
                    Some(report.id),
                )
                .await?;
            let applied: Option<(Uuid,)> = sqlx::query_as(
                r#"
                UPDATE match_reports
                SET status = 'unlocked', unlocked_at = NOW(), updated_at = NOW()
                WHERE request_id = $1 AND status = 'pending'
                RETURNING id
                "#,
            )
            .bind(request_id)
            .fetch_optional(&mut *tx)
            .await?;

            if applied.is_some() {
                tx.commit().await?;
                tracing::info!(
                    request_id = %request_id,
                    account_id = %account.id,
                    "Match report unlocked with one credit"
                );
            } else {
                tx.rollback().await?;
                tracing::info!(
                    request_id = %request_id,
                    "Report was unlocked concurrently, credit not consumed"
                );
            }
        }

        self.generate(request_id).await
    }

    /// Whether the caller may see full supplier contact detail.
    ///
    /// Requires the unlock gate to be open AND either the authenticated
    /// owner or a valid payment token bound to this request.
    pub fn verify_access(
        &self,
        report: &MatchReport,
        token: Option<&str>,
        authenticated_email: Option<&str>,
    ) -> bool {
        if !report.status.is_unlocked() {
            return false;
        }

        if let Some(email) = authenticated_email {
            if normalize_email(email) == normalize_email(&report.email) {
                return true;
            }
        }

        if let Some(token) = token {
            return self
                .tokens
                .verify(
                    token,
                    &report.email,
                    Some(&report.request_id),
                    TokenType::Payment,
                )
                .is_ok();
        }

        false
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ReportRow {
    id: Uuid,
    request_id: String,
    email: String,
    status: String,
    summary: String,
    category: String,
    average_score: Option<f64>,
    candidates: serde_json::Value,
    payment_record_id: Option<Uuid>,
    unlocked_at: Option<OffsetDateTime>,
    completed_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl ReportRow {
    fn into_report(self) -> BillingResult<MatchReport> {
        let candidates: Vec<ScoredSupplier> = serde_json::from_value(self.candidates)
            .map_err(|e| BillingError::Internal(format!("corrupt report candidates: {}", e)))?;
        Ok(MatchReport {
            id: self.id,
            request_id: self.request_id,
            email: self.email,
            status: self
                .status
                .parse()
                .map_err(|e| BillingError::Internal(format!("corrupt report row: {}", e)))?,
            summary: self.summary,
            category: self.category,
            average_score: self.average_score,
            candidates,
            payment_record_id: self.payment_record_id,
            unlocked_at: self.unlocked_at,
            completed_at: self.completed_at,
            created_at: self.created_at,
        })
    }
}
