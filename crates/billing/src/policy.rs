//! Cost policy resolution
//!
//! Maps each feature key to its expected per-use cost. Multiple package tiers
//! may offer the same feature at different prices; the policy keeps the
//! highest configured cost so legitimate tier pricing is never flagged as an
//! anomaly while true underbilling still is.

use sqlx::PgPool;
use std::collections::HashMap;

use crate::error::BillingResult;

/// Expected cost for one feature.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedCost {
    pub cost: i64,
    pub display_name: String,
}

/// Read-only policy snapshot for one detection run.
#[derive(Debug, Clone, Default)]
pub struct CostPolicy {
    map: HashMap<String, ExpectedCost>,
}

impl CostPolicy {
    /// Build a policy from (item_key, item_name, cost_per_use) rows,
    /// keeping the maximum cost observed per feature key.
    pub fn from_rows(rows: impl IntoIterator<Item = (String, String, i64)>) -> Self {
        let mut map: HashMap<String, ExpectedCost> = HashMap::new();
        for (key, name, cost) in rows {
            match map.get(&key) {
                Some(existing) if existing.cost >= cost => {}
                _ => {
                    map.insert(
                        key,
                        ExpectedCost {
                            cost,
                            display_name: name,
                        },
                    );
                }
            }
        }
        Self { map }
    }

    pub fn expected_cost(&self, feature_key: &str) -> Option<&ExpectedCost> {
        self.map.get(feature_key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Load the current cost policy from configured feature pricing.
/// Inactive features are excluded; usage of them is treated as non-evaluable.
pub async fn load_cost_policy(pool: &PgPool) -> BillingResult<CostPolicy> {
    let rows: Vec<(String, String, i64)> = sqlx::query_as(
        r#"
        SELECT fi.item_key, fi.item_name, pfs.cost_per_use
        FROM package_feature_settings pfs
        JOIN feature_items fi ON fi.id = pfs.feature_id
        WHERE fi.is_active = TRUE
        "#,
    )
    .fetch_all(pool)
    .await?;

    let policy = CostPolicy::from_rows(rows);
    tracing::debug!(features = policy.len(), "Loaded cost policy snapshot");
    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_maximum_cost_across_tiers() {
        let policy = CostPolicy::from_rows([
            ("voice_chat".to_string(), "Voice Chat".to_string(), 2),
            ("voice_chat".to_string(), "Voice Chat".to_string(), 5),
            ("voice_chat".to_string(), "Voice Chat".to_string(), 3),
        ]);
        assert_eq!(policy.expected_cost("voice_chat").map(|c| c.cost), Some(5));
    }

    #[test]
    fn distinct_features_are_independent() {
        let policy = CostPolicy::from_rows([
            ("voice_chat".to_string(), "Voice Chat".to_string(), 5),
            ("life_coach".to_string(), "Life Coach".to_string(), 1),
        ]);
        assert_eq!(policy.len(), 2);
        assert_eq!(policy.expected_cost("life_coach").map(|c| c.cost), Some(1));
        assert!(policy.expected_cost("unknown").is_none());
    }
}
