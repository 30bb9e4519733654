//! Detection/correction sweep orchestration
//!
//! One sweep = one detector pass over the trailing window followed by one
//! correction pass over everything pending. The scheduled job and the HTTP
//! entrypoint both run the same sweep.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::Duration;

use meterpay_shared::AlertStatus;

use crate::correction::CorrectionEngine;
use crate::detector::MismatchDetector;
use crate::error::BillingResult;

/// Sweep behavior flags.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SweepOptions {
    /// Run the correction engine after detection.
    #[serde(default = "default_auto_correct")]
    pub auto_correct: bool,
    /// Report intended corrections without mutating anything.
    #[serde(default)]
    pub dry_run: bool,
}

fn default_auto_correct() -> bool {
    true
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            auto_correct: true,
            dry_run: false,
        }
    }
}

/// Batch summary returned to the caller and posted to the ops channel.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectionSummary {
    pub checked_records: usize,
    pub new_mismatches_found: usize,
    pub severe_mismatches: usize,
    /// Alerts still pending after this sweep (e.g. dry run, or auto-correct off).
    pub pending_corrections: usize,
    pub corrections_attempted: usize,
    pub corrections_successful: usize,
    pub corrections_failed: usize,
    pub affected_features: Vec<String>,
}

/// Run a full detection + correction sweep over the trailing window.
///
/// Per-item failures are folded into the summary; only infrastructure
/// failures (cannot read the ledger at all) surface as errors.
pub async fn run_sweep(
    pool: &PgPool,
    window: Duration,
    options: SweepOptions,
) -> BillingResult<DetectionSummary> {
    let detector = MismatchDetector::new(pool.clone());
    let report = detector.detect(window).await?;

    let mut summary = DetectionSummary {
        checked_records: report.checked_records,
        new_mismatches_found: report.new_alerts,
        severe_mismatches: report.severe_mismatches,
        affected_features: report.affected_features,
        ..Default::default()
    };

    if options.auto_correct {
        let engine = CorrectionEngine::new(pool.clone());
        let outcomes = engine.correct_pending(options.dry_run).await?;

        for outcome in &outcomes {
            // Skips are bookkeeping, not corrections.
            if outcome.correction_type.is_some() {
                summary.corrections_attempted += 1;
                match outcome.status {
                    AlertStatus::Corrected => summary.corrections_successful += 1,
                    AlertStatus::Failed => summary.corrections_failed += 1,
                    _ => {}
                }
            }
        }
    }

    summary.pending_corrections = count_pending(pool).await?;

    tracing::info!(
        checked = summary.checked_records,
        new_mismatches = summary.new_mismatches_found,
        attempted = summary.corrections_attempted,
        successful = summary.corrections_successful,
        failed = summary.corrections_failed,
        dry_run = options.dry_run,
        "Billing sweep complete"
    );

    Ok(summary)
}

async fn count_pending(pool: &PgPool) -> BillingResult<usize> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM cost_alerts WHERE correction_status = 'pending'")
            .fetch_one(pool)
            .await?;
    Ok(count as usize)
}
