//! Payment Invariants Module
//!
//! Provides runnable consistency checks for the payment and credit
//! system. These can be run after any mutation or webhook replay to
//! ensure the system is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// A single invariant violation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Account(s) affected, when attributable
    pub account_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - money or credits may be wrong
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct BalanceMismatchRow {
    account_id: Uuid,
    credit_balance: i64,
    ledger_sum: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct BrokenLedgerRow {
    id: Uuid,
    account_id: Uuid,
    credits_before: i64,
    credits_used: i64,
    credits_after: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeBalanceRow {
    account_id: Uuid,
    credit_balance: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateSuccessRow {
    request_id: String,
    plan_family: String,
    success_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct MissingPaidAtRow {
    id: Uuid,
    stripe_session_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct UntracedReportRow {
    request_id: String,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct StaleActiveRow {
    account_id: Uuid,
    subscription_expires_at: Option<OffsetDateTime>,
}

/// Service for running payment invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return a summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_ledger_balance_consistency().await?);
        violations.extend(self.check_ledger_row_arithmetic().await?);
        violations.extend(self.check_no_negative_balance().await?);
        violations.extend(self.check_single_succeeded_payment().await?);
        violations.extend(self.check_succeeded_has_paid_at().await?);
        violations.extend(self.check_unlocked_reports_traceable().await?);
        violations.extend(self.check_active_subscription_valid().await?);

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single named check
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "ledger_balance_consistency" => self.check_ledger_balance_consistency().await,
            "ledger_row_arithmetic" => self.check_ledger_row_arithmetic().await,
            "no_negative_balance" => self.check_no_negative_balance().await,
            "single_succeeded_payment" => self.check_single_succeeded_payment().await,
            "succeeded_has_paid_at" => self.check_succeeded_has_paid_at().await,
            "unlocked_reports_traceable" => self.check_unlocked_reports_traceable().await,
            "active_subscription_valid" => self.check_active_subscription_valid().await,
            _ => Err(BillingError::Validation(format!(
                "unknown invariant check: {}",
                name
            ))),
        }
    }

    pub fn available_checks() -> &'static [&'static str] {
        &[
            "ledger_balance_consistency",
            "ledger_row_arithmetic",
            "no_negative_balance",
            "single_succeeded_payment",
            "succeeded_has_paid_at",
            "unlocked_reports_traceable",
            "active_subscription_valid",
        ]
    }

    /// Invariant 1: An account's balance equals the sum of its ledger.
    ///
    /// Balance mutations and ledger rows are written in one transaction;
    /// a mismatch means a write path bypassed the ledger.
    async fn check_ledger_balance_consistency(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BalanceMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                a.id as account_id,
                a.credit_balance,
                COALESCE(SUM(ct.credits_used), 0)::BIGINT as ledger_sum
            FROM accounts a
            LEFT JOIN credit_transactions ct ON ct.account_id = a.id
            GROUP BY a.id, a.credit_balance
            HAVING a.credit_balance != COALESCE(SUM(ct.credits_used), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "ledger_balance_consistency".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Account balance {} does not match ledger sum {}",
                    row.credit_balance, row.ledger_sum
                ),
                context: serde_json::json!({
                    "credit_balance": row.credit_balance,
                    "ledger_sum": row.ledger_sum,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Every ledger row's arithmetic is internally consistent
    async fn check_ledger_row_arithmetic(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BrokenLedgerRow> = sqlx::query_as(
            r#"
            SELECT id, account_id, credits_before, credits_used, credits_after
            FROM credit_transactions
            WHERE credits_after != credits_before + credits_used
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "ledger_row_arithmetic".to_string(),
                account_ids: vec![row.account_id],
                description: format!(
                    "Ledger row {} breaks arithmetic: {} + {} != {}",
                    row.id, row.credits_before, row.credits_used, row.credits_after
                ),
                context: serde_json::json!({
                    "transaction_id": row.id,
                    "credits_before": row.credits_before,
                    "credits_used": row.credits_used,
                    "credits_after": row.credits_after,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: No account ever holds a negative balance
    async fn check_no_negative_balance(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeBalanceRow> = sqlx::query_as(
            "SELECT id as account_id, credit_balance FROM accounts WHERE credit_balance < 0",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_negative_balance".to_string(),
                account_ids: vec![row.account_id],
                description: format!("Account balance is negative: {}", row.credit_balance),
                context: serde_json::json!({ "credit_balance": row.credit_balance }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: At most one succeeded payment per request and plan
    /// family. A duplicate means entitlements were applied twice.
    async fn check_single_succeeded_payment(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateSuccessRow> = sqlx::query_as(
            r#"
            SELECT
                request_id,
                REGEXP_REPLACE(plan_type, '_(monthly|annual)$', '') as plan_family,
                COUNT(*) as success_count
            FROM payment_records
            WHERE status = 'succeeded' AND request_id IS NOT NULL
            GROUP BY request_id, REGEXP_REPLACE(plan_type, '_(monthly|annual)$', '')
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_succeeded_payment".to_string(),
                account_ids: vec![],
                description: format!(
                    "Request {} has {} succeeded payments for plan family {}",
                    row.request_id, row.success_count, row.plan_family
                ),
                context: serde_json::json!({
                    "request_id": row.request_id,
                    "plan_family": row.plan_family,
                    "success_count": row.success_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 5: Succeeded payments carry a paid_at timestamp
    async fn check_succeeded_has_paid_at(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingPaidAtRow> = sqlx::query_as(
            r#"
            SELECT id, stripe_session_id
            FROM payment_records
            WHERE status = 'succeeded' AND paid_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "succeeded_has_paid_at".to_string(),
                account_ids: vec![],
                description: format!("Succeeded payment {} has no paid_at timestamp", row.id),
                context: serde_json::json!({
                    "payment_record_id": row.id,
                    "stripe_session_id": row.stripe_session_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 6: Unlocked and completed reports trace back to either
    /// a payment record or a credit deduction.
    async fn check_unlocked_reports_traceable(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UntracedReportRow> = sqlx::query_as(
            r#"
            SELECT r.request_id, r.status
            FROM match_reports r
            WHERE r.status IN ('unlocked', 'completed')
              AND r.payment_record_id IS NULL
              AND NOT EXISTS (
                  SELECT 1 FROM credit_transactions ct
                  WHERE ct.request_id = r.request_id
                    AND ct.transaction_type = 'deducted'
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "unlocked_reports_traceable".to_string(),
                account_ids: vec![],
                description: format!(
                    "Report {} is {} without a payment or credit deduction",
                    row.request_id, row.status
                ),
                context: serde_json::json!({
                    "request_id": row.request_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 7: Active subscriptions have an expiry in the future
    async fn check_active_subscription_valid(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleActiveRow> = sqlx::query_as(
            r#"
            SELECT id as account_id, subscription_expires_at
            FROM accounts
            WHERE subscription_status = 'active'
              AND (subscription_expires_at IS NULL OR subscription_expires_at < NOW())
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_subscription_valid".to_string(),
                account_ids: vec![row.account_id],
                description: "Active subscription has no future expiry".to_string(),
                context: serde_json::json!({
                    "subscription_expires_at": row.subscription_expires_at.map(|t| t.to_string()),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_checks_are_unique() {
        let checks = InvariantChecker::available_checks();
        let unique: std::collections::HashSet<_> = checks.iter().collect();
        assert_eq!(checks.len(), unique.len());
        assert_eq!(checks.len(), 7);
    }

    #[test]
    fn test_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }
}
