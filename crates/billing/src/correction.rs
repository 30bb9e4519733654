//! Auto-correction of billing mismatches
//!
//! Consumes pending cost alerts oldest-first and reconciles the account
//! ledger with the expected cost. Each live correction is a small two-phase
//! write: create the correction intent, mutate the balance atomically, append
//! a compensating usage entry, then mark the intent complete. A crash in the
//! middle leaves an inspectable pending/failed correction row instead of a
//! silently lost adjustment.

use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use meterpay_shared::{AlertStatus, CorrectionType, CostAlert};

use crate::error::{BillingError, BillingResult};

/// What the engine intends to do for one alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrectionPlan {
    /// Expected equals actual; nothing to reconcile.
    Skip,
    Apply {
        correction_type: CorrectionType,
        amount: i64,
    },
}

/// Compute the correction implied by an alert's amounts.
/// `charge` when the account was undercharged, `refund` when overcharged.
pub fn plan_correction(expected_amount: i64, actual_amount: i64) -> CorrectionPlan {
    let difference = expected_amount - actual_amount;
    if difference == 0 {
        return CorrectionPlan::Skip;
    }
    let correction_type = if difference > 0 {
        CorrectionType::Charge
    } else {
        CorrectionType::Refund
    };
    CorrectionPlan::Apply {
        correction_type,
        amount: difference.abs(),
    }
}

/// Per-alert result reported back in the batch summary.
#[derive(Debug, Clone, Serialize)]
pub struct CorrectionOutcome {
    pub alert_id: Uuid,
    pub user_id: Uuid,
    pub correction_type: Option<CorrectionType>,
    pub amount: i64,
    pub status: AlertStatus,
    pub dry_run: bool,
    pub error: Option<String>,
}

/// Correction engine service
#[derive(Clone)]
pub struct CorrectionEngine {
    pool: PgPool,
}

impl CorrectionEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Process all pending alerts in creation order (oldest first, to avoid
    /// compounding drift). One alert's failure never aborts the batch.
    ///
    /// With `dry_run` the intended corrections are returned but no alert,
    /// account, or correction row is touched.
    pub async fn correct_pending(&self, dry_run: bool) -> BillingResult<Vec<CorrectionOutcome>> {
        let alerts: Vec<CostAlert> = sqlx::query_as(
            r#"
            SELECT id, user_id, alert_type, usage_record_id,
                   expected_amount, actual_amount, correction_status, metadata, created_at
            FROM cost_alerts
            WHERE correction_status = 'pending'
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut outcomes = Vec::with_capacity(alerts.len());

        for alert in alerts {
            let outcome = match plan_correction(alert.expected_amount, alert.actual_amount) {
                CorrectionPlan::Skip => {
                    let mut status = AlertStatus::Skipped;
                    let mut error = None;
                    if !dry_run {
                        // Same isolation as the apply path: trouble marking
                        // one alert must not abort its siblings.
                        if let Err(e) = self.mark_alert(alert.id, AlertStatus::Skipped).await {
                            let message = e.to_string();
                            tracing::error!(
                                alert_id = %alert.id,
                                error = %message,
                                "Failed to mark consistent alert as skipped"
                            );
                            status = AlertStatus::Failed;
                            error = Some(message);
                        }
                    }
                    CorrectionOutcome {
                        alert_id: alert.id,
                        user_id: alert.user_id,
                        correction_type: None,
                        amount: 0,
                        status,
                        dry_run,
                        error,
                    }
                }
                CorrectionPlan::Apply {
                    correction_type,
                    amount,
                } => {
                    if dry_run {
                        CorrectionOutcome {
                            alert_id: alert.id,
                            user_id: alert.user_id,
                            correction_type: Some(correction_type),
                            amount,
                            status: AlertStatus::Pending,
                            dry_run,
                            error: None,
                        }
                    } else {
                        self.apply_correction(&alert, correction_type, amount).await
                    }
                }
            };
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    /// Live two-phase correction for one alert. Errors are captured into the
    /// outcome, with the correction row left in `failed` for inspection.
    async fn apply_correction(
        &self,
        alert: &CostAlert,
        correction_type: CorrectionType,
        amount: i64,
    ) -> CorrectionOutcome {
        let correction_id = Uuid::new_v4();

        let result = self
            .run_correction_steps(correction_id, alert, correction_type, amount)
            .await;

        match result {
            Ok(()) => {
                tracing::info!(
                    alert_id = %alert.id,
                    user_id = %alert.user_id,
                    correction_type = %correction_type,
                    amount,
                    "Billing correction applied"
                );
                CorrectionOutcome {
                    alert_id: alert.id,
                    user_id: alert.user_id,
                    correction_type: Some(correction_type),
                    amount,
                    status: AlertStatus::Corrected,
                    dry_run: false,
                    error: None,
                }
            }
            Err(e) => {
                let message = e.to_string();
                tracing::error!(
                    alert_id = %alert.id,
                    user_id = %alert.user_id,
                    error = %message,
                    "Billing correction failed"
                );

                // Best-effort failure bookkeeping; the batch continues either way.
                if let Err(mark_err) = self.mark_failed(correction_id, alert.id, &message).await {
                    tracing::error!(
                        alert_id = %alert.id,
                        error = %mark_err,
                        "Failed to record correction failure"
                    );
                }

                CorrectionOutcome {
                    alert_id: alert.id,
                    user_id: alert.user_id,
                    correction_type: Some(correction_type),
                    amount,
                    status: AlertStatus::Failed,
                    dry_run: false,
                    error: Some(message),
                }
            }
        }
    }

    async fn run_correction_steps(
        &self,
        correction_id: Uuid,
        alert: &CostAlert,
        correction_type: CorrectionType,
        amount: i64,
    ) -> BillingResult<()> {
        // Phase 1: durable intent.
        sqlx::query(
            r#"
            INSERT INTO billing_corrections (
                id, user_id, alert_id, correction_type,
                original_amount, expected_amount, correction_amount, status
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
            "#,
        )
        .bind(correction_id)
        .bind(alert.user_id)
        .bind(alert.id)
        .bind(correction_type.as_str())
        .bind(alert.actual_amount)
        .bind(alert.expected_amount)
        .bind(amount)
        .execute(&self.pool)
        .await?;

        // Phase 2: atomic ledger mutation. Overlapping corrections against
        // the same account must not lose updates, so the arithmetic happens
        // in the database, not read-modify-write here.
        let updated = match correction_type {
            CorrectionType::Charge => {
                sqlx::query(
                    "UPDATE user_accounts SET used_quota = used_quota + $2, updated_at = NOW() WHERE user_id = $1",
                )
                .bind(alert.user_id)
                .bind(amount)
                .execute(&self.pool)
                .await?
            }
            CorrectionType::Refund => {
                sqlx::query(
                    "UPDATE user_accounts SET used_quota = GREATEST(used_quota - $2, 0), updated_at = NOW() WHERE user_id = $1",
                )
                .bind(alert.user_id)
                .bind(amount)
                .execute(&self.pool)
                .await?
            }
        };
        if updated.rows_affected() == 0 {
            return Err(BillingError::AccountNotFound(alert.user_id.to_string()));
        }

        // Compensating ledger entry so the audit trail balances.
        let signed_amount = match correction_type {
            CorrectionType::Charge => amount,
            CorrectionType::Refund => -amount,
        };
        sqlx::query(
            r#"
            INSERT INTO usage_records (id, user_id, record_type, amount, source, metadata)
            VALUES ($1, $2, $3, $4, 'billing_correction', $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(alert.user_id)
        .bind(correction_type.usage_record_type())
        .bind(signed_amount)
        .bind(json!({
            "alert_id": alert.id,
            "correction_id": correction_id,
            "feature_key": alert.feature_key(),
        }))
        .execute(&self.pool)
        .await?;

        // Phase 3: mark complete.
        sqlx::query(
            "UPDATE billing_corrections SET status = 'completed', completed_at = NOW() WHERE id = $1",
        )
        .bind(correction_id)
        .execute(&self.pool)
        .await?;

        self.mark_alert(alert.id, AlertStatus::Corrected).await?;
        Ok(())
    }

    async fn mark_alert(&self, alert_id: Uuid, status: AlertStatus) -> BillingResult<()> {
        sqlx::query("UPDATE cost_alerts SET correction_status = $2 WHERE id = $1")
            .bind(alert_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        correction_id: Uuid,
        alert_id: Uuid,
        message: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE billing_corrections SET status = 'failed', error_message = $2 WHERE id = $1",
        )
        .bind(correction_id)
        .bind(message)
        .execute(&self.pool)
        .await?;
        self.mark_alert(alert_id, AlertStatus::Failed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undercharge_plans_a_charge() {
        assert_eq!(
            plan_correction(10, 7),
            CorrectionPlan::Apply {
                correction_type: CorrectionType::Charge,
                amount: 3
            }
        );
    }

    #[test]
    fn overcharge_plans_a_refund() {
        assert_eq!(
            plan_correction(10, 15),
            CorrectionPlan::Apply {
                correction_type: CorrectionType::Refund,
                amount: 5
            }
        );
    }

    #[test]
    fn equal_amounts_plan_a_skip() {
        assert_eq!(plan_correction(10, 10), CorrectionPlan::Skip);
    }

    #[test]
    fn correction_amount_is_absolute_difference() {
        for (expected, actual) in [(10, 7), (7, 10), (100, 1), (1, 100)] {
            if let CorrectionPlan::Apply { amount, .. } = plan_correction(expected, actual) {
                assert_eq!(amount, (expected - actual).abs());
            } else {
                panic!("expected an apply plan");
            }
        }
    }
}
