//! Billing mismatch detection
//!
//! Scans recent usage records, compares each actual charge against the cost
//! policy, and raises one pending alert per newly-detected discrepancy.
//! Re-runs over the same window are idempotent: already-flagged records are
//! filtered up front and the insert also collapses on the unique
//! usage_record_id constraint.

use serde_json::json;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use meterpay_shared::UsageRecord;

use crate::error::BillingResult;
use crate::policy::{load_cost_policy, CostPolicy};

/// Deviation above which a mismatch is reported as severe.
pub const SEVERE_DEVIATION_PCT: f64 = 50.0;

/// A usage record that failed policy evaluation and should be alerted.
#[derive(Debug, Clone, PartialEq)]
pub struct MismatchCandidate {
    pub usage_record_id: Uuid,
    pub user_id: Uuid,
    pub feature_key: String,
    pub feature_name: String,
    pub expected_amount: i64,
    pub actual_amount: i64,
    pub deviation_pct: f64,
}

impl MismatchCandidate {
    pub fn is_severe(&self) -> bool {
        self.deviation_pct.abs() > SEVERE_DEVIATION_PCT
    }
}

/// Evaluate one usage record against the policy.
///
/// Returns None for records that are exempt or non-evaluable:
/// free-quota consumption, explicit fixed-amount charges, camp entitlements,
/// our own compensating correction entries, records with no resolvable
/// feature key, zero expected cost, or a non-positive actual amount.
pub fn evaluate_record(record: &UsageRecord, policy: &CostPolicy) -> Option<MismatchCandidate> {
    if record.record_type == "camp_entitlement" || record.record_type.starts_with("correction_") {
        return None;
    }
    if record.used_free_quota() {
        return None;
    }
    if record.cost_source() == Some("explicit_amount") {
        return None;
    }

    let feature_key = record.feature_key()?;
    let expected = policy.expected_cost(feature_key)?;
    // Zero expected cost cannot be deviated against; skip rather than divide.
    if expected.cost == 0 {
        return None;
    }
    if record.amount <= 0 || record.amount == expected.cost {
        return None;
    }

    let deviation_pct =
        (record.amount - expected.cost) as f64 / expected.cost as f64 * 100.0;

    Some(MismatchCandidate {
        usage_record_id: record.id,
        user_id: record.user_id,
        feature_key: feature_key.to_string(),
        feature_name: expected.display_name.clone(),
        expected_amount: expected.cost,
        actual_amount: record.amount,
        deviation_pct,
    })
}

/// Outcome of one detection pass.
#[derive(Debug, Clone, Default)]
pub struct DetectionReport {
    pub checked_records: usize,
    pub new_alerts: usize,
    pub severe_mismatches: usize,
    pub affected_features: Vec<String>,
}

/// Mismatch detection service
#[derive(Clone)]
pub struct MismatchDetector {
    pool: PgPool,
}

impl MismatchDetector {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Scan the trailing window and insert a pending alert for each
    /// newly-detected mismatch.
    pub async fn detect(&self, window: Duration) -> BillingResult<DetectionReport> {
        let window_start = OffsetDateTime::now_utc() - window;

        let records: Vec<UsageRecord> = sqlx::query_as(
            r#"
            SELECT id, user_id, record_type, amount, source, metadata, created_at
            FROM usage_records
            WHERE created_at >= $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(window_start)
        .fetch_all(&self.pool)
        .await?;

        let policy = load_cost_policy(&self.pool).await?;

        // Records alerted in this window, for idempotent re-runs. The unique
        // constraint on usage_record_id is the real guard; this avoids
        // pointless conflict-insert round trips.
        let flagged: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT usage_record_id FROM cost_alerts WHERE created_at >= $1",
        )
        .bind(window_start)
        .fetch_all(&self.pool)
        .await?;
        let flagged: std::collections::HashSet<Uuid> =
            flagged.into_iter().map(|(id,)| id).collect();

        let mut report = DetectionReport {
            checked_records: records.len(),
            ..Default::default()
        };

        for record in &records {
            if flagged.contains(&record.id) {
                continue;
            }
            let Some(candidate) = evaluate_record(record, &policy) else {
                continue;
            };

            let inserted = sqlx::query(
                r#"
                INSERT INTO cost_alerts (
                    id, user_id, alert_type, usage_record_id,
                    expected_amount, actual_amount, correction_status, metadata
                ) VALUES ($1, $2, 'billing_mismatch', $3, $4, $5, 'pending', $6)
                ON CONFLICT (usage_record_id) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(candidate.user_id)
            .bind(candidate.usage_record_id)
            .bind(candidate.expected_amount)
            .bind(candidate.actual_amount)
            .bind(json!({
                "feature_key": candidate.feature_key,
                "feature_name": candidate.feature_name,
                "usage_record_id": candidate.usage_record_id,
                "deviation_percentage": candidate.deviation_pct,
            }))
            .execute(&self.pool)
            .await?;

            if inserted.rows_affected() == 0 {
                // Another invocation flagged this record concurrently.
                continue;
            }

            tracing::warn!(
                user_id = %candidate.user_id,
                feature_key = %candidate.feature_key,
                expected = candidate.expected_amount,
                actual = candidate.actual_amount,
                deviation_pct = candidate.deviation_pct,
                "Billing mismatch detected"
            );

            report.new_alerts += 1;
            if candidate.is_severe() {
                report.severe_mismatches += 1;
            }
            if !report.affected_features.contains(&candidate.feature_key) {
                report.affected_features.push(candidate.feature_key.clone());
            }
        }

        tracing::info!(
            checked = report.checked_records,
            new_alerts = report.new_alerts,
            severe = report.severe_mismatches,
            "Mismatch detection pass complete"
        );

        Ok(report)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::policy::CostPolicy;
    use serde_json::json;

    fn policy() -> CostPolicy {
        CostPolicy::from_rows([
            ("voice_chat".to_string(), "Voice Chat".to_string(), 10),
            ("free_feature".to_string(), "Free Feature".to_string(), 0),
        ])
    }

    fn record(amount: i64, metadata: serde_json::Value) -> UsageRecord {
        UsageRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            record_type: "conversation".to_string(),
            amount,
            source: None,
            metadata,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn flags_underbilled_record_with_deviation() {
        let r = record(7, json!({"feature_key": "voice_chat"}));
        let c = evaluate_record(&r, &policy()).expect("should flag");
        assert_eq!(c.expected_amount, 10);
        assert_eq!(c.actual_amount, 7);
        assert!((c.deviation_pct - (-30.0)).abs() < f64::EPSILON);
        assert!(!c.is_severe());
    }

    #[test]
    fn overbilling_past_threshold_is_severe() {
        let r = record(16, json!({"feature_key": "voice_chat"}));
        let c = evaluate_record(&r, &policy()).expect("should flag");
        assert!(c.deviation_pct > SEVERE_DEVIATION_PCT);
        assert!(c.is_severe());
    }

    #[test]
    fn matching_amount_is_not_flagged() {
        let r = record(10, json!({"feature_key": "voice_chat"}));
        assert!(evaluate_record(&r, &policy()).is_none());
    }

    #[test]
    fn free_quota_usage_is_exempt() {
        let r = record(7, json!({"feature_key": "voice_chat", "free_quota_used": true}));
        assert!(evaluate_record(&r, &policy()).is_none());
    }

    #[test]
    fn explicit_amount_is_exempt() {
        let r = record(
            99,
            json!({"feature_key": "voice_chat", "cost_source": "explicit_amount"}),
        );
        assert!(evaluate_record(&r, &policy()).is_none());
    }

    #[test]
    fn camp_entitlement_and_correction_records_are_exempt() {
        let mut r = record(7, json!({"feature_key": "voice_chat"}));
        r.record_type = "camp_entitlement".to_string();
        assert!(evaluate_record(&r, &policy()).is_none());

        let mut r = record(7, json!({"feature_key": "voice_chat"}));
        r.record_type = "correction_refund".to_string();
        assert!(evaluate_record(&r, &policy()).is_none());
    }

    #[test]
    fn zero_expected_cost_skips_instead_of_dividing() {
        let r = record(5, json!({"feature_key": "free_feature"}));
        assert!(evaluate_record(&r, &policy()).is_none());
    }

    #[test]
    fn unresolvable_feature_key_is_skipped() {
        let r = record(5, json!({}));
        assert!(evaluate_record(&r, &policy()).is_none());
        let r = record(5, json!({"feature_key": "not_configured"}));
        assert!(evaluate_record(&r, &policy()).is_none());
    }

    #[test]
    fn non_positive_actual_is_skipped() {
        let r = record(0, json!({"feature_key": "voice_chat"}));
        assert!(evaluate_record(&r, &policy()).is_none());
        let r = record(-3, json!({"feature_key": "voice_chat"}));
        assert!(evaluate_record(&r, &policy()).is_none());
    }
}
