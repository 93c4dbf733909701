//! Plan catalog
//!
//! Single lookup path from a plan family to its credit grant and
//! rollover cap. The catalog reads `plan_configs` first and falls back
//! to a hardcoded table for the known legacy families, so a deleted
//! catalog row can never abort a payment transition.

use sqlx::PgPool;
use supplymatch_shared::PlanType;

use crate::error::BillingResult;

/// Credit grant configuration for one plan family
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PlanCredits {
    /// Credits granted per billing period
    pub credits_granted: i64,
    /// Maximum unused credits carried into the next period (0 = no rollover)
    pub max_rollover: i64,
}

/// Fallback grants for the legacy plan families
const LEGACY_DEFAULTS: &[(&str, PlanCredits)] = &[
    (
        "starter",
        PlanCredits {
            credits_granted: 5,
            max_rollover: 0,
        },
    ),
    (
        "professional",
        PlanCredits {
            credits_granted: 15,
            max_rollover: 3,
        },
    ),
];

/// Fallback lookup against the hardcoded legacy table
pub fn legacy_default(family: &str) -> Option<PlanCredits> {
    LEGACY_DEFAULTS
        .iter()
        .find(|(name, _)| *name == family)
        .map(|(_, credits)| *credits)
}

/// Catalog resolving plan families to credit grants
#[derive(Clone)]
pub struct PlanCatalog {
    pool: PgPool,
}

impl PlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Resolve a plan type to its credit grant.
    ///
    /// Lookup order: `plan_configs` row for the family, then the legacy
    /// default table. An entirely unrecognized family grants zero credits
    /// and logs a warning; this function never fails the caller.
    pub async fn credits_for(&self, plan: PlanType) -> PlanCredits {
        let family = plan.family();

        match self.lookup_config(family).await {
            Ok(Some(credits)) => return credits,
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    family = %family,
                    error = %e,
                    "Plan config lookup failed, falling back to legacy defaults"
                );
            }
        }

        match legacy_default(family) {
            Some(credits) => credits,
            None => {
                tracing::warn!(
                    family = %family,
                    "Unrecognized plan family, granting zero credits"
                );
                PlanCredits {
                    credits_granted: 0,
                    max_rollover: 0,
                }
            }
        }
    }

    async fn lookup_config(&self, family: &str) -> BillingResult<Option<PlanCredits>> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT credits_granted, max_rollover FROM plan_configs WHERE plan_family = $1",
        )
        .bind(family)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(credits_granted, max_rollover)| PlanCredits {
            credits_granted,
            max_rollover,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_defaults_cover_known_families() {
        let starter = legacy_default("starter").unwrap();
        assert_eq!(starter.credits_granted, 5);
        assert_eq!(starter.max_rollover, 0);

        let professional = legacy_default("professional").unwrap();
        assert_eq!(professional.credits_granted, 15);
        assert_eq!(professional.max_rollover, 3);
    }

    #[test]
    fn test_unknown_family_has_no_default() {
        assert!(legacy_default("platinum").is_none());
        assert!(legacy_default("credit_topup").is_none());
    }
}
