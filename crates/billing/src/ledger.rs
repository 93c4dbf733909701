//! Credit ledger
//!
//! Append-only accounting trail for every credit balance change. The
//! balance mutation and the ledger row are written inside one database
//! transaction: there is never a ledger entry without a matching balance
//! change, and never a balance change without its entry.

use sqlx::{PgPool, Postgres, Transaction};
use supplymatch_shared::{TransactionReason, TransactionType};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// One immutable ledger row
#[derive(Debug, Clone, serde::Serialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub request_id: Option<String>,
    pub report_id: Option<Uuid>,
    /// Signed delta applied to the balance
    pub credits_used: i64,
    pub credits_before: i64,
    pub credits_after: i64,
    pub transaction_type: TransactionType,
    pub reason: TransactionReason,
    pub created_at: OffsetDateTime,
}

/// Ledger service; all writes go through [`CreditLedger::record`]
#[derive(Clone)]
pub struct CreditLedger {
    pool: PgPool,
}

impl CreditLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply a signed credit delta to an account inside the caller's
    /// transaction.
    ///
    /// Locks the account row, rejects deductions that would drive the
    /// balance negative, then writes the new balance and the ledger row.
    /// Both become visible together when the caller commits.
    pub async fn record(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        account_id: Uuid,
        delta: i64,
        transaction_type: TransactionType,
        reason: TransactionReason,
        request_id: Option<&str>,
        report_id: Option<Uuid>,
    ) -> BillingResult<CreditTransaction> {
        let before: Option<(i64,)> =
            sqlx::query_as("SELECT credit_balance FROM accounts WHERE id = $1 FOR UPDATE")
                .bind(account_id)
                .fetch_optional(&mut **tx)
                .await?;

        let before = before
            .map(|(b,)| b)
            .ok_or_else(|| BillingError::NotFound(format!("account {}", account_id)))?;

        let after = before + delta;
        if after < 0 {
            return Err(BillingError::InsufficientCredits {
                available: before,
                requested: -delta,
            });
        }

        sqlx::query("UPDATE accounts SET credit_balance = $1, updated_at = NOW() WHERE id = $2")
            .bind(after)
            .bind(account_id)
            .execute(&mut **tx)
            .await?;

        let (id, created_at): (Uuid, OffsetDateTime) = sqlx::query_as(
            r#"
            INSERT INTO credit_transactions
                (account_id, request_id, report_id, credits_used, credits_before, credits_after,
                 transaction_type, reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, created_at
            "#,
        )
        .bind(account_id)
        .bind(request_id)
        .bind(report_id)
        .bind(delta)
        .bind(before)
        .bind(after)
        .bind(transaction_type.as_str())
        .bind(reason.as_str())
        .fetch_one(&mut **tx)
        .await?;

        tracing::info!(
            account_id = %account_id,
            delta = delta,
            before = before,
            after = after,
            reason = %reason,
            "Credit ledger entry recorded"
        );

        Ok(CreditTransaction {
            id,
            account_id,
            request_id: request_id.map(str::to_string),
            report_id,
            credits_used: delta,
            credits_before: before,
            credits_after: after,
            transaction_type,
            reason,
            created_at,
        })
    }

    /// Record a single delta in its own transaction
    pub async fn record_standalone(
        &self,
        account_id: Uuid,
        delta: i64,
        transaction_type: TransactionType,
        reason: TransactionReason,
        request_id: Option<&str>,
        report_id: Option<Uuid>,
    ) -> BillingResult<CreditTransaction> {
        let mut tx = self.pool.begin().await?;
        let entry = self
            .record(
                &mut tx,
                account_id,
                delta,
                transaction_type,
                reason,
                request_id,
                report_id,
            )
            .await?;
        tx.commit().await?;
        Ok(entry)
    }

    /// Ledger history for an account, newest first
    pub async fn history(&self, account_id: Uuid) -> BillingResult<Vec<CreditTransaction>> {
        let rows: Vec<LedgerRow> = sqlx::query_as(
            r#"
            SELECT id, account_id, request_id, report_id, credits_used, credits_before,
                   credits_after, transaction_type, reason, created_at
            FROM credit_transactions
            WHERE account_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LedgerRow::into_transaction).collect()
    }

    /// Sum of all signed deltas for an account; must always equal the
    /// account's current balance (see the invariant checker)
    pub async fn signed_sum(&self, account_id: Uuid) -> BillingResult<i64> {
        let (sum,): (Option<i64>,) = sqlx::query_as(
            "SELECT SUM(credits_used)::BIGINT FROM credit_transactions WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(sum.unwrap_or(0))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerRow {
    id: Uuid,
    account_id: Uuid,
    request_id: Option<String>,
    report_id: Option<Uuid>,
    credits_used: i64,
    credits_before: i64,
    credits_after: i64,
    transaction_type: String,
    reason: String,
    created_at: OffsetDateTime,
}

impl LedgerRow {
    fn into_transaction(self) -> BillingResult<CreditTransaction> {
        Ok(CreditTransaction {
            id: self.id,
            account_id: self.account_id,
            request_id: self.request_id,
            report_id: self.report_id,
            credits_used: self.credits_used,
            credits_before: self.credits_before,
            credits_after: self.credits_after,
            transaction_type: self
                .transaction_type
                .parse()
                .map_err(|e| BillingError::Internal(format!("corrupt ledger row: {}", e)))?,
            reason: self
                .reason
                .parse()
                .map_err(|e| BillingError::Internal(format!("corrupt ledger row: {}", e)))?,
            created_at: self.created_at,
        })
    }
}
