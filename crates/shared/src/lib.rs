// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! SupplyMatch Shared Types
//!
//! Domain enums and plain types shared between the payment core and the
//! API surface. Everything here is serde-friendly and persistable via sqlx.

pub mod db;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use types::{
    BillingInterval, PaymentStatus, PlanType, ReportStatus, SubscriptionStatus, TransactionReason,
    TransactionType,
};
