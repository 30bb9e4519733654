//! Benefit-grant orchestration
//!
//! Applies the entitlement a paid order bought: camp access, quota top-up, or
//! subscription. Every grant is written idempotently (unique constraints plus
//! upserts), so the caller may invoke this again for the same order without
//! double-granting. Affiliate conversion and commission are recorded
//! best-effort after the grant.

use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use meterpay_shared::{Order, Package, PackageKind};

use crate::error::PaymentResult;

const CAMP_KEY_PREFIX: &str = "camp-";
const DEFAULT_SUBSCRIPTION_DAYS: i32 = 30;

/// Benefit resolved from an order's package, before touching the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PlannedBenefit {
    Camp { camp_type: String },
    Quota { points: i64 },
    Subscription { duration_days: i32 },
}

/// What actually happened when a grant was applied.
#[derive(Debug, Clone, Serialize)]
pub struct GrantSummary {
    pub package_key: String,
    pub benefit: Option<PlannedBenefit>,
    /// False when the entitlement already existed (repeat invocation).
    pub newly_granted: bool,
    pub commission_recorded: bool,
}

/// Quota grants for well-known package keys that predate the package catalog.
fn fallback_quota(package_key: &str) -> Option<i64> {
    match package_key {
        "basic" => Some(50),
        "member365" => Some(1_000),
        "partner" => Some(9_999_999),
        _ => None,
    }
}

/// Decide which benefit a package confers. `camp-` keys are camp access even
/// without a catalog row; otherwise the catalog drives the branch, with the
/// legacy quota map as a last resort.
pub fn plan_benefit(package_key: &str, package: Option<&Package>) -> Option<PlannedBenefit> {
    if let Some(camp_type) = package_key.strip_prefix(CAMP_KEY_PREFIX) {
        return Some(PlannedBenefit::Camp {
            camp_type: camp_type.to_string(),
        });
    }

    if let Some(pkg) = package {
        return match pkg.package_kind() {
            Some(PackageKind::Camp) => Some(PlannedBenefit::Camp {
                camp_type: pkg.package_key.clone(),
            }),
            Some(PackageKind::Quota) => {
                let points = pkg.grant_quota.or_else(|| fallback_quota(package_key))?;
                Some(PlannedBenefit::Quota { points })
            }
            Some(PackageKind::Subscription) => Some(PlannedBenefit::Subscription {
                duration_days: pkg.duration_days.unwrap_or(DEFAULT_SUBSCRIPTION_DAYS),
            }),
            None => None,
        };
    }

    fallback_quota(package_key).map(|points| PlannedBenefit::Quota { points })
}

/// Commission owed on an order at the partner's level-1 rate, in the order's
/// minor currency units.
pub fn commission_amount(order_amount: i64, rate: f64) -> i64 {
    if !(0.0..=1.0).contains(&rate) {
        return 0;
    }
    (order_amount as f64 * rate).round() as i64
}

/// Applies entitlements for paid orders.
#[derive(Clone)]
pub struct BenefitGranter {
    pool: PgPool,
}

impl BenefitGranter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Grant the benefit for a paid order, then record affiliate conversion.
    /// Unknown packages are logged and skipped, not errors; the order's paid
    /// status never depends on this call succeeding.
    pub async fn grant_for_order(&self, order: &Order) -> PaymentResult<GrantSummary> {
        let package = self.load_package(&order.package_key).await?;
        let benefit = plan_benefit(&order.package_key, package.as_ref());

        let newly_granted = match &benefit {
            Some(PlannedBenefit::Camp { camp_type }) => {
                self.grant_camp(order, camp_type).await?
            }
            Some(PlannedBenefit::Quota { points }) => {
                self.grant_quota(order.user_id, *points).await?;
                true
            }
            Some(PlannedBenefit::Subscription { duration_days }) => {
                self.grant_subscription(order, *duration_days).await?;
                true
            }
            None => {
                tracing::warn!(
                    order_no = %order.order_no,
                    package_key = %order.package_key,
                    "No benefit mapping for package; nothing granted"
                );
                false
            }
        };

        let commission_recorded = self.record_affiliate_conversion(order).await;

        tracing::info!(
            order_no = %order.order_no,
            package_key = %order.package_key,
            benefit = ?benefit,
            newly_granted,
            commission_recorded,
            "Benefit grant processed"
        );

        Ok(GrantSummary {
            package_key: order.package_key.clone(),
            benefit,
            newly_granted,
            commission_recorded,
        })
    }

    async fn load_package(&self, package_key: &str) -> PaymentResult<Option<Package>> {
        let package = sqlx::query_as::<_, Package>(
            "SELECT package_key, display_name, kind, grant_quota, duration_days
             FROM packages WHERE package_key = $1",
        )
        .bind(package_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(package)
    }

    /// Camp access. The (user_id, camp_type) unique pair makes a repeat grant
    /// a no-op; returns whether this call created the entitlement.
    async fn grant_camp(&self, order: &Order, camp_type: &str) -> PaymentResult<bool> {
        let camp_name = self.camp_display_name(camp_type).await;

        let result = sqlx::query(
            "INSERT INTO user_camp_purchases
                 (user_id, camp_type, camp_name, purchase_price, transaction_id)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (user_id, camp_type) DO NOTHING",
        )
        .bind(order.user_id)
        .bind(camp_type)
        .bind(&camp_name)
        .bind(order.amount)
        .bind(&order.trade_no)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Display name lookup is cosmetic; a missing template falls back to the
    /// camp type itself.
    async fn camp_display_name(&self, camp_type: &str) -> String {
        let row: Result<Option<(String,)>, sqlx::Error> =
            sqlx::query_as("SELECT camp_name FROM camp_templates WHERE camp_type = $1")
                .bind(camp_type)
                .fetch_optional(&self.pool)
                .await;
        match row {
            Ok(Some((name,))) => name,
            Ok(None) => camp_type.to_string(),
            Err(e) => {
                tracing::warn!(camp_type, error = %e, "Camp template lookup failed");
                camp_type.to_string()
            }
        }
    }

    /// Additive quota top-up, atomic at the storage layer.
    async fn grant_quota(&self, user_id: Uuid, points: i64) -> PaymentResult<()> {
        sqlx::query(
            "INSERT INTO user_accounts (user_id, total_quota, used_quota)
             VALUES ($1, $2, 0)
             ON CONFLICT (user_id) DO UPDATE
                 SET total_quota = user_accounts.total_quota + EXCLUDED.total_quota,
                     updated_at = NOW()",
        )
        .bind(user_id)
        .bind(points)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// One active subscription per user; a new purchase replaces the window.
    async fn grant_subscription(&self, order: &Order, duration_days: i32) -> PaymentResult<()> {
        sqlx::query(
            "INSERT INTO subscriptions (user_id, package_key, status, start_date, end_date)
             VALUES ($1, $2, 'active', NOW(), NOW() + make_interval(days => $3))
             ON CONFLICT (user_id) DO UPDATE
                 SET package_key = EXCLUDED.package_key,
                     status = 'active',
                     start_date = EXCLUDED.start_date,
                     end_date = EXCLUDED.end_date",
        )
        .bind(order.user_id)
        .bind(&order.package_key)
        .bind(duration_days)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Convert the buyer's level-1 referral (at most once) and write the
    /// commission. Best-effort: failures are logged and never propagate into
    /// the grant path.
    async fn record_affiliate_conversion(&self, order: &Order) -> bool {
        match self.try_record_conversion(order).await {
            Ok(recorded) => recorded,
            Err(e) => {
                tracing::warn!(
                    order_no = %order.order_no,
                    error = %e,
                    "Affiliate conversion failed; grant unaffected"
                );
                false
            }
        }
    }

    async fn try_record_conversion(&self, order: &Order) -> PaymentResult<bool> {
        let referral: Option<(Uuid, Uuid, f64)> = sqlx::query_as(
            "SELECT id, partner_id, commission_rate_l1
             FROM partner_referrals
             WHERE referred_user_id = $1 AND level = 1 AND converted_at IS NULL",
        )
        .bind(order.user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((referral_id, partner_id, rate)) = referral else {
            return Ok(false);
        };

        // The converted_at guard means a concurrent invocation converts at
        // most one of the two.
        let converted = sqlx::query(
            "UPDATE partner_referrals
             SET conversion_status = 'converted', converted_at = NOW()
             WHERE id = $1 AND converted_at IS NULL",
        )
        .bind(referral_id)
        .execute(&self.pool)
        .await?;

        if converted.rows_affected() == 0 {
            return Ok(false);
        }

        let amount = commission_amount(order.amount, rate);
        sqlx::query(
            "INSERT INTO partner_commissions
                 (partner_id, referral_id, order_no, order_amount, commission_amount)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (referral_id, order_no) DO NOTHING",
        )
        .bind(partner_id)
        .bind(referral_id)
        .bind(&order.order_no)
        .bind(order.amount)
        .bind(amount)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            order_no = %order.order_no,
            partner_id = %partner_id,
            commission = amount,
            "Affiliate conversion recorded"
        );
        Ok(true)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn package(key: &str, kind: &str, quota: Option<i64>, days: Option<i32>) -> Package {
        Package {
            package_key: key.to_string(),
            display_name: key.to_string(),
            kind: kind.to_string(),
            grant_quota: quota,
            duration_days: days,
        }
    }

    #[test]
    fn camp_prefix_wins_without_catalog_row() {
        let benefit = plan_benefit("camp-writing", None).unwrap();
        assert_eq!(
            benefit,
            PlannedBenefit::Camp {
                camp_type: "writing".to_string()
            }
        );
    }

    #[test]
    fn catalog_kind_drives_the_branch() {
        let pkg = package("pro-quota", "quota", Some(500), None);
        assert_eq!(
            plan_benefit("pro-quota", Some(&pkg)),
            Some(PlannedBenefit::Quota { points: 500 })
        );

        let pkg = package("yearly", "subscription", None, Some(365));
        assert_eq!(
            plan_benefit("yearly", Some(&pkg)),
            Some(PlannedBenefit::Subscription { duration_days: 365 })
        );

        let pkg = package("bootcamp", "camp", None, None);
        assert_eq!(
            plan_benefit("bootcamp", Some(&pkg)),
            Some(PlannedBenefit::Camp {
                camp_type: "bootcamp".to_string()
            })
        );
    }

    #[test]
    fn legacy_keys_fall_back_to_the_quota_map() {
        assert_eq!(
            plan_benefit("basic", None),
            Some(PlannedBenefit::Quota { points: 50 })
        );
        assert_eq!(
            plan_benefit("member365", None),
            Some(PlannedBenefit::Quota { points: 1_000 })
        );
        assert_eq!(plan_benefit("unknown-pkg", None), None);
    }

    #[test]
    fn subscription_without_duration_uses_default() {
        let pkg = package("monthly", "subscription", None, None);
        assert_eq!(
            plan_benefit("monthly", Some(&pkg)),
            Some(PlannedBenefit::Subscription {
                duration_days: DEFAULT_SUBSCRIPTION_DAYS
            })
        );
    }

    #[test]
    fn commission_rounds_and_rejects_bad_rates() {
        assert_eq!(commission_amount(10_000, 0.15), 1_500);
        assert_eq!(commission_amount(999, 0.1), 100);
        assert_eq!(commission_amount(10_000, -0.1), 0);
        assert_eq!(commission_amount(10_000, 1.5), 0);
    }
}
