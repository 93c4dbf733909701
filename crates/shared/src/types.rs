//! Domain enums for payments, subscriptions, credits, and reports.
//!
//! All enums serialize as snake_case strings and are stored as TEXT
//! columns; `as_str`/`FromStr` are the single source of truth for the
//! wire and database representations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error returned when a string does not map to a known enum variant
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// What a checkout session was purchased for.
///
/// Subscription plans come in two families ("starter", "professional"),
/// each with a monthly and an annual billing interval. The remaining
/// variants are one-time purchases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    /// One-time unlock of a single match report
    ReportUnlock,
    StarterMonthly,
    StarterAnnual,
    ProfessionalMonthly,
    ProfessionalAnnual,
    /// Standalone credit purchase
    CreditTopup,
    /// Managed sourcing service fee (audit-only, no entitlement)
    ManagedServiceFee,
    /// Managed sourcing savings share fee (audit-only, no entitlement)
    ManagedSavingsFee,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::ReportUnlock => "report_unlock",
            PlanType::StarterMonthly => "starter_monthly",
            PlanType::StarterAnnual => "starter_annual",
            PlanType::ProfessionalMonthly => "professional_monthly",
            PlanType::ProfessionalAnnual => "professional_annual",
            PlanType::CreditTopup => "credit_topup",
            PlanType::ManagedServiceFee => "managed_service_fee",
            PlanType::ManagedSavingsFee => "managed_savings_fee",
        }
    }

    /// Plan family with the billing-interval suffix stripped.
    ///
    /// This is the key into the plan catalog: both "starter_monthly" and
    /// "starter_annual" resolve credits via the "starter" family.
    pub fn family(&self) -> &'static str {
        match self {
            PlanType::StarterMonthly | PlanType::StarterAnnual => "starter",
            PlanType::ProfessionalMonthly | PlanType::ProfessionalAnnual => "professional",
            PlanType::ReportUnlock => "report_unlock",
            PlanType::CreditTopup => "credit_topup",
            PlanType::ManagedServiceFee => "managed_service_fee",
            PlanType::ManagedSavingsFee => "managed_savings_fee",
        }
    }

    /// True for recurring subscription plans that grant a credit allocation
    pub fn is_recurring(&self) -> bool {
        matches!(
            self,
            PlanType::StarterMonthly
                | PlanType::StarterAnnual
                | PlanType::ProfessionalMonthly
                | PlanType::ProfessionalAnnual
        )
    }

    /// Billing interval for recurring plans, None for one-time purchases
    pub fn billing_interval(&self) -> Option<BillingInterval> {
        match self {
            PlanType::StarterMonthly | PlanType::ProfessionalMonthly => {
                Some(BillingInterval::Monthly)
            }
            PlanType::StarterAnnual | PlanType::ProfessionalAnnual => Some(BillingInterval::Annual),
            _ => None,
        }
    }

    /// True for managed-service fees which create audit-only payment records
    pub fn is_managed_fee(&self) -> bool {
        matches!(
            self,
            PlanType::ManagedServiceFee | PlanType::ManagedSavingsFee
        )
    }
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "report_unlock" => Ok(PlanType::ReportUnlock),
            "starter_monthly" => Ok(PlanType::StarterMonthly),
            "starter_annual" => Ok(PlanType::StarterAnnual),
            "professional_monthly" => Ok(PlanType::ProfessionalMonthly),
            "professional_annual" => Ok(PlanType::ProfessionalAnnual),
            "credit_topup" => Ok(PlanType::CreditTopup),
            "managed_service_fee" => Ok(PlanType::ManagedServiceFee),
            "managed_savings_fee" => Ok(PlanType::ManagedSavingsFee),
            other => Err(UnknownVariant::new("plan type", other)),
        }
    }
}

/// Billing interval for recurring plans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Monthly,
    Annual,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "monthly",
            BillingInterval::Annual => "annual",
        }
    }
}

impl fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a payment record.
///
/// `Pending` is the only non-terminal state; a record transitions to a
/// terminal state exactly once and is never moved back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Canceled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "succeeded" => Ok(PaymentStatus::Succeeded),
            "failed" => Ok(PaymentStatus::Failed),
            "canceled" => Ok(PaymentStatus::Canceled),
            other => Err(UnknownVariant::new("payment status", other)),
        }
    }
}

/// Subscription status on an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    None,
    Active,
    Expired,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::None => "none",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(SubscriptionStatus::None),
            "active" => Ok(SubscriptionStatus::Active),
            "expired" => Ok(SubscriptionStatus::Expired),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            other => Err(UnknownVariant::new("subscription status", other)),
        }
    }
}

/// Reveal state of a match report.
///
/// `Pending`: no entitlement consumed yet, preview only.
/// `Unlocked`: payment/credit applied, matching not yet run.
/// `Completed`: scored supplier detail is present and viewable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Pending,
    Unlocked,
    Completed,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Pending => "pending",
            ReportStatus::Unlocked => "unlocked",
            ReportStatus::Completed => "completed",
        }
    }

    /// Whether entitlement has been consumed for this report
    pub fn is_unlocked(&self) -> bool {
        matches!(self, ReportStatus::Unlocked | ReportStatus::Completed)
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ReportStatus::Pending),
            "unlocked" => Ok(ReportStatus::Unlocked),
            "completed" => Ok(ReportStatus::Completed),
            other => Err(UnknownVariant::new("report status", other)),
        }
    }
}

/// Direction of a credit ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Added,
    Deducted,
    Expired,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Added => "added",
            TransactionType::Deducted => "deducted",
            TransactionType::Expired => "expired",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "added" => Ok(TransactionType::Added),
            "deducted" => Ok(TransactionType::Deducted),
            "expired" => Ok(TransactionType::Expired),
            other => Err(UnknownVariant::new("transaction type", other)),
        }
    }
}

/// Why a credit ledger entry was written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionReason {
    SubscriptionAllocation,
    TopUp,
    MatchGeneration,
    UnlockRequest,
    Rollover,
}

impl TransactionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionReason::SubscriptionAllocation => "subscription_allocation",
            TransactionReason::TopUp => "top_up",
            TransactionReason::MatchGeneration => "match_generation",
            TransactionReason::UnlockRequest => "unlock_request",
            TransactionReason::Rollover => "rollover",
        }
    }
}

impl fmt::Display for TransactionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionReason {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subscription_allocation" => Ok(TransactionReason::SubscriptionAllocation),
            "top_up" => Ok(TransactionReason::TopUp),
            "match_generation" => Ok(TransactionReason::MatchGeneration),
            "unlock_request" => Ok(TransactionReason::UnlockRequest),
            "rollover" => Ok(TransactionReason::Rollover),
            other => Err(UnknownVariant::new("transaction reason", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_family_strips_interval_suffix() {
        assert_eq!(PlanType::StarterMonthly.family(), "starter");
        assert_eq!(PlanType::StarterAnnual.family(), "starter");
        assert_eq!(PlanType::ProfessionalMonthly.family(), "professional");
        assert_eq!(PlanType::ProfessionalAnnual.family(), "professional");
    }

    #[test]
    fn test_recurring_plans() {
        assert!(PlanType::StarterMonthly.is_recurring());
        assert!(PlanType::ProfessionalAnnual.is_recurring());
        assert!(!PlanType::ReportUnlock.is_recurring());
        assert!(!PlanType::CreditTopup.is_recurring());
        assert!(!PlanType::ManagedServiceFee.is_recurring());
    }

    #[test]
    fn test_plan_type_round_trip() {
        for plan in [
            PlanType::ReportUnlock,
            PlanType::StarterMonthly,
            PlanType::StarterAnnual,
            PlanType::ProfessionalMonthly,
            PlanType::ProfessionalAnnual,
            PlanType::CreditTopup,
            PlanType::ManagedServiceFee,
            PlanType::ManagedSavingsFee,
        ] {
            assert_eq!(plan.as_str().parse::<PlanType>().unwrap(), plan);
        }
        assert!("platinum_weekly".parse::<PlanType>().is_err());
    }

    #[test]
    fn test_payment_status_terminality() {
        assert!(!PaymentStatus::Pending.is_terminal());
        assert!(PaymentStatus::Succeeded.is_terminal());
        assert!(PaymentStatus::Failed.is_terminal());
        assert!(PaymentStatus::Canceled.is_terminal());
    }

    #[test]
    fn test_report_status_unlock_gate() {
        assert!(!ReportStatus::Pending.is_unlocked());
        assert!(ReportStatus::Unlocked.is_unlocked());
        assert!(ReportStatus::Completed.is_unlocked());
    }

    #[test]
    fn test_serde_matches_as_str() {
        let json = serde_json::to_string(&TransactionReason::SubscriptionAllocation).unwrap();
        assert_eq!(json, "\"subscription_allocation\"");
        let json = serde_json::to_string(&PlanType::ManagedSavingsFee).unwrap();
        assert_eq!(json, "\"managed_savings_fee\"");
    }
}
