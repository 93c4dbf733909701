//! Account state store
//!
//! The mutable per-user fields the reconciliation engine drives:
//! subscription status/plan/expiry, credit balance, and the Stripe
//! customer/subscription linkage. Accounts are created on first
//! successful payment or explicit registration and never hard-deleted.

use sqlx::PgPool;
use supplymatch_shared::{PlanType, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, serde::Serialize)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub subscription_status: SubscriptionStatus,
    pub subscription_plan: Option<PlanType>,
    pub subscription_expires_at: Option<OffsetDateTime>,
    pub credit_balance: i64,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub is_active: bool,
    pub created_at: OffsetDateTime,
}

impl Account {
    /// Whether the account currently holds an unexpired active subscription
    pub fn has_active_subscription(&self, now: OffsetDateTime) -> bool {
        self.subscription_status == SubscriptionStatus::Active
            && self.subscription_expires_at.is_some_and(|exp| exp > now)
    }
}

/// Normalize an email the way the accounts table stores it
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Clone)]
pub struct AccountService {
    pool: PgPool,
}

impl AccountService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_email(&self, email: &str) -> BillingResult<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(
            r#"
            SELECT id, email, subscription_status, subscription_plan, subscription_expires_at,
                   credit_balance, stripe_customer_id, stripe_subscription_id, is_active, created_at
            FROM accounts
            WHERE email = $1
            "#,
        )
        .bind(normalize_email(email))
        .fetch_optional(&self.pool)
        .await?;

        row.map(AccountRow::into_account).transpose()
    }

    pub async fn get(&self, id: Uuid) -> BillingResult<Account> {
        let row: Option<AccountRow> = sqlx::query_as(
            r#"
            SELECT id, email, subscription_status, subscription_plan, subscription_expires_at,
                   credit_balance, stripe_customer_id, stripe_subscription_id, is_active, created_at
            FROM accounts
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AccountRow::into_account)
            .transpose()?
            .ok_or_else(|| BillingError::NotFound(format!("account {}", id)))
    }

    /// Find the account for an email, creating it when a payment arrives
    /// for an address we have never seen (first successful payment creates
    /// the account).
    pub async fn find_or_create(&self, email: &str) -> BillingResult<Account> {
        let email = normalize_email(email);

        // ON CONFLICT keeps this race-safe when a webhook and a sync both
        // see a brand-new address at the same time.
        sqlx::query(
            r#"
            INSERT INTO accounts (email, subscription_status, credit_balance)
            VALUES ($1, 'none', 0)
            ON CONFLICT (email) DO NOTHING
            "#,
        )
        .bind(&email)
        .execute(&self.pool)
        .await?;

        self.find_by_email(&email)
            .await?
            .ok_or_else(|| BillingError::Internal(format!("account upsert lost for {}", email)))
    }

    /// Activate a subscription: plan, expiry, and Stripe linkage.
    ///
    /// The credit balance is NOT touched here; the engine writes it
    /// through the ledger in the same transaction as the ledger entry.
    pub async fn activate_subscription(
        &self,
        account_id: Uuid,
        plan: PlanType,
        expires_at: OffsetDateTime,
        stripe_customer_id: Option<&str>,
        stripe_subscription_id: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE accounts
            SET subscription_status = 'active',
                subscription_plan = $2,
                subscription_expires_at = $3,
                stripe_customer_id = COALESCE($4, stripe_customer_id),
                stripe_subscription_id = COALESCE($5, stripe_subscription_id),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(account_id)
        .bind(plan.as_str())
        .bind(expires_at)
        .bind(stripe_customer_id)
        .bind(stripe_subscription_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            account_id = %account_id,
            plan = %plan,
            expires_at = %expires_at,
            "Subscription activated"
        );

        Ok(())
    }

    pub async fn set_subscription_status(
        &self,
        account_id: Uuid,
        status: SubscriptionStatus,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE accounts SET subscription_status = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(status.as_str())
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark active subscriptions past their expiry as expired.
    /// Returns the number of accounts transitioned.
    pub async fn expire_lapsed(&self, email: &str) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET subscription_status = 'expired', updated_at = NOW()
            WHERE email = $1
              AND subscription_status = 'active'
              AND subscription_expires_at IS NOT NULL
              AND subscription_expires_at < NOW()
            "#,
        )
        .bind(normalize_email(email))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Find the account linked to a Stripe customer id
    pub async fn find_by_stripe_customer(
        &self,
        customer_id: &str,
    ) -> BillingResult<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(
            r#"
            SELECT id, email, subscription_status, subscription_plan, subscription_expires_at,
                   credit_balance, stripe_customer_id, stripe_subscription_id, is_active, created_at
            FROM accounts
            WHERE stripe_customer_id = $1
            "#,
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(AccountRow::into_account).transpose()
    }

    /// Soft-delete: accounts are only ever deactivated
    pub async fn deactivate(&self, account_id: Uuid) -> BillingResult<()> {
        sqlx::query("UPDATE accounts SET is_active = FALSE, updated_at = NOW() WHERE id = $1")
            .bind(account_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    email: String,
    subscription_status: String,
    subscription_plan: Option<String>,
    subscription_expires_at: Option<OffsetDateTime>,
    credit_balance: i64,
    stripe_customer_id: Option<String>,
    stripe_subscription_id: Option<String>,
    is_active: bool,
    created_at: OffsetDateTime,
}

impl AccountRow {
    fn into_account(self) -> BillingResult<Account> {
        Ok(Account {
            id: self.id,
            email: self.email,
            subscription_status: self
                .subscription_status
                .parse()
                .map_err(|e| BillingError::Internal(format!("corrupt account row: {}", e)))?,
            subscription_plan: self
                .subscription_plan
                .as_deref()
                .map(str::parse)
                .transpose()
                .map_err(|e| BillingError::Internal(format!("corrupt account row: {}", e)))?,
            subscription_expires_at: self.subscription_expires_at,
            credit_balance: self.credit_balance,
            stripe_customer_id: self.stripe_customer_id,
            stripe_subscription_id: self.stripe_subscription_id,
            is_active: self.is_active,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn account(status: SubscriptionStatus, expires: Option<OffsetDateTime>) -> Account {
        Account {
            id: Uuid::new_v4(),
            email: "buyer@example.com".to_string(),
            subscription_status: status,
            subscription_plan: None,
            subscription_expires_at: expires,
            credit_balance: 0,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            is_active: true,
            created_at: datetime!(2025-01-01 00:00 UTC),
        }
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(normalize_email("  Buyer@Example.COM "), "buyer@example.com");
    }

    #[test]
    fn test_active_subscription_requires_future_expiry() {
        let now = datetime!(2025-06-01 00:00 UTC);
        let active = account(
            SubscriptionStatus::Active,
            Some(datetime!(2025-07-01 00:00 UTC)),
        );
        assert!(active.has_active_subscription(now));

        let lapsed = account(
            SubscriptionStatus::Active,
            Some(datetime!(2025-05-01 00:00 UTC)),
        );
        assert!(!lapsed.has_active_subscription(now));

        let no_expiry = account(SubscriptionStatus::Active, None);
        assert!(!no_expiry.has_active_subscription(now));

        let canceled = account(
            SubscriptionStatus::Canceled,
            Some(datetime!(2025-07-01 00:00 UTC)),
        );
        assert!(!canceled.has_active_subscription(now));
    }
}
