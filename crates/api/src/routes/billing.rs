//! Billing sweep endpoint

use axum::{extract::State, Json};
use time::Duration;

use meterpay_billing::{run_sweep, DetectionSummary, SweepOptions};

use crate::error::ApiResult;
use crate::state::AppState;

/// Run a detection + correction sweep over the trailing window.
///
/// The body is optional; an empty `{}` runs with auto-correct on and dry-run
/// off. The summary is returned to the caller and, when it crosses the
/// notification threshold, posted to the ops channel without blocking the
/// response.
pub async fn run_check(
    State(state): State<AppState>,
    body: Option<Json<SweepOptions>>,
) -> ApiResult<Json<DetectionSummary>> {
    let options = body.map(|Json(o)| o).unwrap_or_default();
    let window = Duration::hours(state.config.detection_window_hours);

    let summary = run_sweep(&state.pool, window, options).await?;

    if state
        .notifier
        .should_notify(&summary, state.config.mismatch_alert_threshold)
    {
        let notifier = state.notifier.clone();
        let to_send = summary.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.send_summary(&to_send).await {
                tracing::error!("Failed to send ops notification: {}", e);
            }
        });
    }

    Ok(Json(summary))
}
