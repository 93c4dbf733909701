// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Payment Core
//!
//! Tests critical boundary conditions in:
//! - Entitlement allocation (rollover, calendar expiry)
//! - Access tokens (expiry boundaries, type confusion)
//! - Reconciliation classification (purpose fallback, top-up quantities)
//! - Shared payment types (terminality, plan families)

#[cfg(test)]
mod entitlement_edge_tests {
    use crate::entitlement::{add_calendar_months, resolve_allocation};
    use crate::plans::PlanCredits;
    use supplymatch_shared::PlanType;
    use time::macros::datetime;

    const STARTER: PlanCredits = PlanCredits {
        credits_granted: 5,
        max_rollover: 0,
    };
    const PROFESSIONAL: PlanCredits = PlanCredits {
        credits_granted: 15,
        max_rollover: 3,
    };

    // =========================================================================
    // Renewal with a balance above the rollover cap keeps exactly the cap
    // =========================================================================
    #[test]
    fn test_rollover_caps_at_plan_maximum() {
        let now = datetime!(2025-03-01 12:00 UTC);
        let allocation =
            resolve_allocation(PlanType::ProfessionalMonthly, PROFESSIONAL, 5, now);
        assert_eq!(allocation.new_balance, 18); // 15 + min(5, 3)
    }

    // =========================================================================
    // A zero-rollover plan forfeits the whole remaining balance
    // =========================================================================
    #[test]
    fn test_no_rollover_resets_balance_to_grant() {
        let now = datetime!(2025-03-01 12:00 UTC);
        let allocation = resolve_allocation(PlanType::StarterMonthly, STARTER, 4, now);
        assert_eq!(allocation.new_balance, 5);
        assert_eq!(allocation.delta(4), 1);
    }

    // =========================================================================
    // A negative balance never rolls over (defensive; ledger forbids it)
    // =========================================================================
    #[test]
    fn test_nonpositive_balance_rolls_nothing() {
        let now = datetime!(2025-03-01 12:00 UTC);
        let allocation =
            resolve_allocation(PlanType::ProfessionalMonthly, PROFESSIONAL, 0, now);
        assert_eq!(allocation.new_balance, 15);
    }

    // =========================================================================
    // Expiry never stacks: allocating twice from the same instant gives
    // the same expiry, not double the period
    // =========================================================================
    #[test]
    fn test_expiry_does_not_stack() {
        let now = datetime!(2025-06-15 09:30 UTC);
        let first = resolve_allocation(PlanType::StarterMonthly, STARTER, 0, now);
        let second = resolve_allocation(PlanType::StarterMonthly, STARTER, 5, now);
        assert_eq!(first.new_expiry, second.new_expiry);
        assert_eq!(first.new_expiry, datetime!(2025-07-15 09:30 UTC));
    }

    // =========================================================================
    // Month-end clamping across short months and leap years
    // =========================================================================
    #[test]
    fn test_month_end_clamping() {
        assert_eq!(
            add_calendar_months(datetime!(2025-01-31 00:00 UTC), 1),
            datetime!(2025-02-28 00:00 UTC)
        );
        assert_eq!(
            add_calendar_months(datetime!(2024-01-31 00:00 UTC), 1),
            datetime!(2024-02-29 00:00 UTC)
        );
        assert_eq!(
            add_calendar_months(datetime!(2025-12-31 00:00 UTC), 2),
            datetime!(2026-02-28 00:00 UTC)
        );
    }

    // =========================================================================
    // Annual allocation from a leap day lands on Feb 28 the next year
    // =========================================================================
    #[test]
    fn test_annual_expiry_from_leap_day() {
        let allocation = resolve_allocation(
            PlanType::ProfessionalAnnual,
            PROFESSIONAL,
            0,
            datetime!(2024-02-29 10:00 UTC),
        );
        assert_eq!(allocation.new_expiry, datetime!(2025-02-28 10:00 UTC));
    }

    // =========================================================================
    // An unrecognized family degrades to a zero grant but still rolls
    // nothing and produces a valid expiry
    // =========================================================================
    #[test]
    fn test_zero_grant_allocation_is_well_formed() {
        let zero = PlanCredits {
            credits_granted: 0,
            max_rollover: 0,
        };
        let now = datetime!(2025-03-31 00:00 UTC);
        let allocation = resolve_allocation(PlanType::StarterMonthly, zero, 7, now);
        assert_eq!(allocation.new_balance, 0);
        assert_eq!(allocation.delta(7), -7);
        assert_eq!(allocation.new_expiry, datetime!(2025-04-30 00:00 UTC));
    }
}

#[cfg(test)]
mod token_edge_tests {
    use crate::tokens::{AccessTokenService, TokenType};

    fn service() -> AccessTokenService {
        AccessTokenService::new("edge-case-secret")
    }

    // =========================================================================
    // A payment token presented as a verification token is rejected even
    // though signature, email, and age all check out
    // =========================================================================
    #[test]
    fn test_token_type_confusion_rejected() {
        let svc = service();
        let token = svc
            .generate_at("a@b.com", Some("REQ-1"), TokenType::Payment, 0)
            .unwrap();
        assert!(svc
            .verify_at(&token, "a@b.com", None, TokenType::EmailVerification, 1)
            .is_err());
    }

    // =========================================================================
    // Tampering with the signature half fails verification
    // =========================================================================
    #[test]
    fn test_signature_half_tamper_rejected() {
        let svc = service();
        let token = svc
            .generate_at("a@b.com", Some("REQ-1"), TokenType::Payment, 0)
            .unwrap();
        let (payload, sig) = token.split_once('.').unwrap();
        let mut sig_chars: Vec<char> = sig.chars().collect();
        sig_chars[0] = if sig_chars[0] == '0' { '1' } else { '0' };
        let tampered = format!("{}.{}", payload, sig_chars.into_iter().collect::<String>());
        assert!(svc
            .verify_at(&tampered, "a@b.com", Some("REQ-1"), TokenType::Payment, 1)
            .is_err());
    }

    // =========================================================================
    // A token with no dot separator is malformed, not a panic
    // =========================================================================
    #[test]
    fn test_missing_separator_is_malformed() {
        let svc = service();
        assert!(svc
            .verify_at("nodotshere", "a@b.com", None, TokenType::PasswordReset, 0)
            .is_err());
        assert!(svc
            .verify_at("", "a@b.com", None, TokenType::PasswordReset, 0)
            .is_err());
    }

    // =========================================================================
    // The shortest-lived token expires after exactly one hour
    // =========================================================================
    #[test]
    fn test_password_reset_expires_after_one_hour() {
        let svc = service();
        let token = svc
            .generate_at("a@b.com", None, TokenType::PasswordReset, 0)
            .unwrap();
        assert!(svc
            .verify_at(&token, "a@b.com", None, TokenType::PasswordReset, 3_599_999)
            .is_ok());
        assert!(svc
            .verify_at(&token, "a@b.com", None, TokenType::PasswordReset, 3_600_000)
            .is_err());
    }
}

#[cfg(test)]
mod reconcile_edge_tests {
    use crate::reconcile::{derive_topup_quantity, forfeited_credits, PaymentPurpose};
    use supplymatch_shared::PlanType;

    // =========================================================================
    // Metadata quantity wins over the derived amount even when they differ
    // =========================================================================
    #[test]
    fn test_metadata_quantity_overrides_amount() {
        assert_eq!(derive_topup_quantity(Some(3), 50_000, 1000), 3);
    }

    // =========================================================================
    // Amounts that do not divide evenly floor, but never below one
    // =========================================================================
    #[test]
    fn test_quantity_flooring() {
        assert_eq!(derive_topup_quantity(None, 2999, 1000), 2);
        assert_eq!(derive_topup_quantity(None, 1, 1000), 1);
    }

    // =========================================================================
    // Degenerate config (zero unit price) cannot divide by zero
    // =========================================================================
    #[test]
    fn test_zero_unit_price_is_safe() {
        assert_eq!(derive_topup_quantity(None, 10_000, 0), 1);
        assert_eq!(derive_topup_quantity(None, 10_000, -5), 1);
    }

    // =========================================================================
    // A record reconstructed without metadata still classifies managed
    // fees correctly from its plan type
    // =========================================================================
    #[test]
    fn test_sparse_event_classification() {
        assert_eq!(
            PaymentPurpose::classify(None, PlanType::ManagedSavingsFee),
            PaymentPurpose::ManagedSavings
        );
        assert_eq!(
            PaymentPurpose::classify(None, PlanType::ReportUnlock),
            PaymentPurpose::Standard
        );
    }

    // =========================================================================
    // Forfeiture is clamped at zero when the balance fits the rollover
    // =========================================================================
    #[test]
    fn test_forfeiture_never_negative() {
        assert_eq!(forfeited_credits(1, 15, 16), 0);
        assert_eq!(forfeited_credits(0, 5, 5), 0);
        // Balance 50 on a professional renewal: only 3 roll, 47 forfeit
        assert_eq!(forfeited_credits(50, 15, 18), 47);
    }
}

#[cfg(test)]
mod type_edge_tests {
    use supplymatch_shared::{PaymentStatus, PlanType, ReportStatus};

    // =========================================================================
    // Pending is the only non-terminal payment status
    // =========================================================================
    #[test]
    fn test_pending_is_only_nonterminal() {
        assert!(!PaymentStatus::Pending.is_terminal());
        assert!(PaymentStatus::Succeeded.is_terminal());
        assert!(PaymentStatus::Failed.is_terminal());
        assert!(PaymentStatus::Canceled.is_terminal());
    }

    // =========================================================================
    // Families strip exactly one billing-interval suffix
    // =========================================================================
    #[test]
    fn test_family_stripping() {
        assert_eq!(PlanType::StarterMonthly.family(), "starter");
        assert_eq!(PlanType::StarterAnnual.family(), "starter");
        assert_eq!(PlanType::ProfessionalMonthly.family(), "professional");
        // One-time plans are their own family
        assert_eq!(PlanType::ReportUnlock.family(), "report_unlock");
        assert_eq!(PlanType::CreditTopup.family(), "credit_topup");
    }

    // =========================================================================
    // The unlock gate opens for unlocked AND completed, nothing else
    // =========================================================================
    #[test]
    fn test_unlock_gate_statuses() {
        assert!(!ReportStatus::Pending.is_unlocked());
        assert!(ReportStatus::Unlocked.is_unlocked());
        assert!(ReportStatus::Completed.is_unlocked());
    }

    // =========================================================================
    // Unknown plan strings fail to parse rather than defaulting
    // =========================================================================
    #[test]
    fn test_unknown_plan_string_is_an_error() {
        assert!("platinum_monthly".parse::<PlanType>().is_err());
        assert!("".parse::<PlanType>().is_err());
    }
}
