// Database-backed reconciliation tests. Each test gets its own
// migrated database from the sqlx test harness.
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use sqlx::PgPool;
use std::sync::Arc;
use supplymatch_billing::{
    add_calendar_months, BillingError, BillingResult, MatchRequestSummary, MatchScore,
    MatchScorer, PaymentPurpose, PaymentService, ReconcileOutcome, SessionFacts, StripeConfig,
    Supplier,
};
use supplymatch_shared::{
    PaymentStatus, PlanType, SubscriptionStatus, TransactionReason, TransactionType,
};
use time::macros::datetime;
use time::OffsetDateTime;

const BUYER: &str = "buyer@example.com";
const PAID_AT: OffsetDateTime = datetime!(2026-03-01 12:00 UTC);

struct FixedScorer;

impl MatchScorer for FixedScorer {
    fn score(
        &self,
        _request: &MatchRequestSummary,
        supplier: &Supplier,
    ) -> BillingResult<MatchScore> {
        Ok(MatchScore {
            score: 50,
            factors: vec![],
            explanation: format!("baseline fit for {}", supplier.name),
        })
    }
}

fn test_config() -> StripeConfig {
    StripeConfig {
        secret_key: "sk_test_key".to_string(),
        webhook_secret: "whsec_test_secret".to_string(),
        price_report_unlock: "price_unlock".to_string(),
        price_starter_monthly: "price_starter_m".to_string(),
        price_starter_annual: "price_starter_a".to_string(),
        price_professional_monthly: "price_pro_m".to_string(),
        price_professional_annual: "price_pro_a".to_string(),
        price_credit_topup: "price_topup".to_string(),
        credit_unit_price_cents: 1000,
        checkout_return_url: "https://app.test".to_string(),
    }
}

fn service(pool: PgPool) -> PaymentService {
    PaymentService::new(test_config(), "test_token_secret", pool, Arc::new(FixedScorer))
}

fn session_facts(
    session_id: &str,
    plan_type: PlanType,
    purpose: PaymentPurpose,
    request_id: Option<&str>,
    quantity: Option<i64>,
) -> SessionFacts {
    SessionFacts {
        session_id: session_id.to_string(),
        payment_intent_id: Some(format!("pi_{}", session_id)),
        email: BUYER.to_string(),
        request_id: request_id.map(str::to_string),
        purpose,
        plan_type,
        amount_cents: 4900,
        quantity,
        stripe_customer_id: Some("cus_test_1".to_string()),
        stripe_subscription_id: Some("sub_test_1".to_string()),
        paid_at: PAID_AT,
    }
}

async fn seed_pending_report(pool: &PgPool, request_id: &str) {
    sqlx::query(
        r#"
        INSERT INTO match_reports (request_id, email, status, summary, category)
        VALUES ($1, $2, 'pending', 'corrugated boxes', 'packaging')
        "#,
    )
    .bind(request_id)
    .bind(BUYER)
    .execute(pool)
    .await
    .unwrap();
}

async fn report_state(pool: &PgPool, request_id: &str) -> (String, Option<uuid::Uuid>) {
    sqlx::query_as("SELECT status, payment_record_id FROM match_reports WHERE request_id = $1")
        .bind(request_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[sqlx::test(migrations = "../../migrations")]
async fn insufficient_credits_leaves_no_partial_entry(pool: PgPool) {
    let svc = service(pool);
    let account = svc.accounts.find_or_create(BUYER).await.unwrap();

    let err = svc
        .ledger
        .record_standalone(
            account.id,
            -3,
            TransactionType::Deducted,
            TransactionReason::MatchGeneration,
            Some("req-1"),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BillingError::InsufficientCredits {
            available: 0,
            requested: 3
        }
    ));

    // The rejected deduction left neither a ledger row nor a balance change
    assert!(svc.ledger.history(account.id).await.unwrap().is_empty());
    let account = svc.accounts.find_by_email(BUYER).await.unwrap().unwrap();
    assert_eq!(account.credit_balance, 0);
}

#[sqlx::test(migrations = "../../migrations")]
async fn replayed_session_applies_entitlements_once(pool: PgPool) {
    let svc = service(pool);
    svc.records
        .create_pending("cs_sub_replay", None, BUYER, 4900, PlanType::StarterMonthly)
        .await
        .unwrap();

    let facts = session_facts(
        "cs_sub_replay",
        PlanType::StarterMonthly,
        PaymentPurpose::Standard,
        None,
        None,
    );

    let first = svc.engine.apply_completed_session(&facts).await.unwrap();
    let ReconcileOutcome::Applied { payment, warning } = first else {
        panic!("first delivery must apply the transition");
    };
    assert!(warning.is_none());
    assert_eq!(payment.status, PaymentStatus::Succeeded);
    // The provider-side completion instant is persisted, not the
    // processing time
    assert_eq!(payment.paid_at, Some(PAID_AT));

    let second = svc.engine.apply_completed_session(&facts).await.unwrap();
    assert!(matches!(second, ReconcileOutcome::AlreadyApplied(_)));

    // Exactly one allocation, however many deliveries arrived
    let account = svc.accounts.find_by_email(BUYER).await.unwrap().unwrap();
    assert_eq!(account.credit_balance, 5);
    assert_eq!(account.subscription_status, SubscriptionStatus::Active);
    assert_eq!(
        account.subscription_expires_at,
        Some(add_calendar_months(PAID_AT, 1))
    );

    let history = svc.ledger.history(account.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].credits_used, 5);
    assert_eq!(history[0].reason, TransactionReason::SubscriptionAllocation);
    assert_eq!(svc.ledger.signed_sum(account.id).await.unwrap(), 5);
}

#[sqlx::test(migrations = "../../migrations")]
async fn subscription_purchase_unlocks_bound_report(pool: PgPool) {
    let svc = service(pool.clone());
    seed_pending_report(&pool, "req-sub").await;
    let record = svc
        .records
        .create_pending(
            "cs_sub_bound",
            Some("req-sub"),
            BUYER,
            4900,
            PlanType::StarterMonthly,
        )
        .await
        .unwrap();

    let facts = session_facts(
        "cs_sub_bound",
        PlanType::StarterMonthly,
        PaymentPurpose::Standard,
        Some("req-sub"),
        None,
    );
    let outcome = svc.engine.apply_completed_session(&facts).await.unwrap();
    assert!(outcome.warning().is_none());

    // The purchase itself opens the report; no credit is consumed for it
    let (status, payment_record_id) = report_state(&pool, "req-sub").await;
    assert_eq!(status, "completed");
    assert_eq!(payment_record_id, Some(record.id));

    let account = svc.accounts.find_by_email(BUYER).await.unwrap().unwrap();
    assert_eq!(account.credit_balance, 5);
    let history = svc.ledger.history(account.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].reason, TransactionReason::SubscriptionAllocation);
}

#[sqlx::test(migrations = "../../migrations")]
async fn request_bound_topup_writes_two_entries(pool: PgPool) {
    let svc = service(pool.clone());
    seed_pending_report(&pool, "req-top").await;
    svc.records
        .create_pending(
            "cs_topup",
            Some("req-top"),
            BUYER,
            3000,
            PlanType::CreditTopup,
        )
        .await
        .unwrap();

    let facts = session_facts(
        "cs_topup",
        PlanType::CreditTopup,
        PaymentPurpose::CreditTopup,
        Some("req-top"),
        Some(3),
    );
    let outcome = svc.engine.apply_completed_session(&facts).await.unwrap();
    assert!(outcome.warning().is_none());

    let account = svc.accounts.find_by_email(BUYER).await.unwrap().unwrap();
    assert_eq!(account.credit_balance, 2);

    // One grant, one immediate consumption, committed together
    let history = svc.ledger.history(account.id).await.unwrap();
    assert_eq!(history.len(), 2);
    let mut entries: Vec<(i64, TransactionReason)> = history
        .iter()
        .map(|entry| (entry.credits_used, entry.reason))
        .collect();
    entries.sort_by_key(|(delta, _)| *delta);
    assert_eq!(
        entries,
        vec![
            (-1, TransactionReason::UnlockRequest),
            (3, TransactionReason::TopUp),
        ]
    );

    let (status, _) = report_state(&pool, "req-top").await;
    assert_eq!(status, "completed");
}

#[sqlx::test(migrations = "../../migrations")]
async fn generate_for_account_consumes_one_credit_once(pool: PgPool) {
    let svc = service(pool.clone());
    let account = svc.accounts.find_or_create(BUYER).await.unwrap();
    svc.ledger
        .record_standalone(
            account.id,
            5,
            TransactionType::Added,
            TransactionReason::TopUp,
            None,
            None,
        )
        .await
        .unwrap();
    seed_pending_report(&pool, "req-gen").await;

    let report = svc
        .reports
        .generate_for_account(&account, "req-gen")
        .await
        .unwrap();
    assert_eq!(report.status.as_str(), "completed");

    let refreshed = svc.accounts.find_by_email(BUYER).await.unwrap().unwrap();
    assert_eq!(refreshed.credit_balance, 4);
    assert_eq!(svc.ledger.history(account.id).await.unwrap().len(), 2);

    // Regenerating an already unlocked report is free
    svc.reports
        .generate_for_account(&account, "req-gen")
        .await
        .unwrap();
    let refreshed = svc.accounts.find_by_email(BUYER).await.unwrap().unwrap();
    assert_eq!(refreshed.credit_balance, 4);
    assert_eq!(svc.ledger.history(account.id).await.unwrap().len(), 2);
}
