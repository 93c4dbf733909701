//! Entitlement resolver
//!
//! Pure computation of the new credit balance and subscription expiry
//! for a plan allocation. No I/O here: the reconciliation engine owns
//! persistence and the matching ledger entry.
//!
//! ## Rules
//!
//! - Rollover: `new_balance = granted + min(current_balance, max_rollover)`
//!   when the plan allows rollover and there is a positive balance to
//!   carry; otherwise the renewal resets the balance to the plan's grant.
//! - Expiry: one calendar month (monthly plans) or one calendar year
//!   (annual plans) from allocation time. Periods never stack on top of
//!   the previous expiry.

use supplymatch_shared::{BillingInterval, PlanType};
use time::{Date, Duration, Month, OffsetDateTime};

use crate::plans::PlanCredits;

/// Result of resolving a subscription allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub new_balance: i64,
    pub new_expiry: OffsetDateTime,
}

impl Allocation {
    /// Signed net balance delta relative to the balance before the
    /// allocation; the ledger entries the caller writes must sum to this.
    pub fn delta(&self, current_balance: i64) -> i64 {
        self.new_balance - current_balance
    }
}

/// Resolve the balance and expiry a plan allocation produces.
///
/// `current_balance` is the account balance at allocation time; `now`
/// is the allocation instant the expiry is computed from.
pub fn resolve_allocation(
    plan: PlanType,
    credits: PlanCredits,
    current_balance: i64,
    now: OffsetDateTime,
) -> Allocation {
    let rolled_over = if credits.max_rollover > 0 && current_balance > 0 {
        current_balance.min(credits.max_rollover)
    } else {
        0
    };

    let months = match plan.billing_interval() {
        Some(BillingInterval::Annual) => 12,
        // One-time plans never reach the resolver; monthly is the safe floor
        Some(BillingInterval::Monthly) | None => 1,
    };

    Allocation {
        new_balance: credits.credits_granted + rolled_over,
        new_expiry: add_calendar_months(now, months),
    }
}

/// Add whole calendar months, clamping the day to the target month's length
/// (Jan 31 + 1 month = Feb 28/29).
pub fn add_calendar_months(dt: OffsetDateTime, months: i32) -> OffsetDateTime {
    let total = (dt.year() * 12 + dt.month() as i32 - 1) + months;
    let year = total.div_euclid(12);
    let month_index = total.rem_euclid(12) as u8 + 1;

    let month = Month::try_from(month_index).unwrap_or(Month::January);
    let max_day = time::util::days_in_year_month(year, month);
    let day = dt.day().min(max_day);

    match Date::from_calendar_date(year, month, day) {
        Ok(date) => dt.replace_date(date),
        // Unreachable with a clamped day; keep a sane value regardless
        Err(_) => dt + Duration::days(30 * months as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const PROFESSIONAL: PlanCredits = PlanCredits {
        credits_granted: 15,
        max_rollover: 3,
    };
    const STARTER: PlanCredits = PlanCredits {
        credits_granted: 5,
        max_rollover: 0,
    };

    #[test]
    fn test_rollover_caps_carried_credits() {
        let now = datetime!(2025-03-10 12:00 UTC);
        let alloc = resolve_allocation(PlanType::ProfessionalMonthly, PROFESSIONAL, 5, now);
        // 15 granted + min(5, 3) carried
        assert_eq!(alloc.new_balance, 18);
        assert_eq!(alloc.delta(5), 13);
    }

    #[test]
    fn test_zero_balance_gets_plain_grant() {
        let now = datetime!(2025-03-10 12:00 UTC);
        let alloc = resolve_allocation(PlanType::ProfessionalMonthly, PROFESSIONAL, 0, now);
        assert_eq!(alloc.new_balance, 15);
    }

    #[test]
    fn test_no_rollover_plan_resets_balance() {
        let now = datetime!(2025-03-10 12:00 UTC);
        // 4 leftover credits are discarded: starter disallows rollover
        let alloc = resolve_allocation(PlanType::StarterMonthly, STARTER, 4, now);
        assert_eq!(alloc.new_balance, 5);
        assert_eq!(alloc.delta(4), 1);
    }

    #[test]
    fn test_monthly_expiry_one_calendar_month() {
        let now = datetime!(2025-03-10 12:00 UTC);
        let alloc = resolve_allocation(PlanType::StarterMonthly, STARTER, 0, now);
        assert_eq!(alloc.new_expiry, datetime!(2025-04-10 12:00 UTC));
    }

    #[test]
    fn test_annual_expiry_one_calendar_year() {
        let now = datetime!(2025-03-10 12:00 UTC);
        let alloc = resolve_allocation(PlanType::ProfessionalAnnual, PROFESSIONAL, 0, now);
        assert_eq!(alloc.new_expiry, datetime!(2026-03-10 12:00 UTC));
    }

    #[test]
    fn test_expiry_computed_from_now_not_previous_expiry() {
        // The previous expiry plays no role: two allocations at the same
        // instant produce the same expiry regardless of history.
        let now = datetime!(2025-06-01 00:00 UTC);
        let first = resolve_allocation(PlanType::StarterMonthly, STARTER, 0, now);
        let second = resolve_allocation(PlanType::StarterMonthly, STARTER, 5, now);
        assert_eq!(first.new_expiry, second.new_expiry);
    }

    #[test]
    fn test_month_end_clamping() {
        let now = datetime!(2025-01-31 09:30 UTC);
        assert_eq!(
            add_calendar_months(now, 1),
            datetime!(2025-02-28 09:30 UTC)
        );
        // Leap year keeps the 29th
        let now = datetime!(2024-01-31 09:30 UTC);
        assert_eq!(
            add_calendar_months(now, 1),
            datetime!(2024-02-29 09:30 UTC)
        );
    }

    #[test]
    fn test_year_boundary() {
        let now = datetime!(2025-12-15 00:00 UTC);
        assert_eq!(
            add_calendar_months(now, 1),
            datetime!(2026-01-15 00:00 UTC)
        );
    }

    #[test]
    fn test_leap_day_annual() {
        let now = datetime!(2024-02-29 10:00 UTC);
        assert_eq!(
            add_calendar_months(now, 12),
            datetime!(2025-02-28 10:00 UTC)
        );
    }
}
