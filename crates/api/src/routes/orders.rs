//! Order reconciliation endpoint

use axum::{extract::State, Json};
use serde::Deserialize;

use meterpay_payments::ReconcileOutcome;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ReconcileRequest {
    pub order_no: String,
    /// Query the payment gateway even though the order is locally pending.
    #[serde(default)]
    pub force_gateway_query: bool,
}

/// Reconcile a single order against the payment provider.
pub async fn reconcile(
    State(state): State<AppState>,
    Json(req): Json<ReconcileRequest>,
) -> ApiResult<Json<ReconcileOutcome>> {
    if req.order_no.trim().is_empty() {
        return Err(ApiError::Validation("order_no is required".to_string()));
    }

    let outcome = state
        .reconciler
        .reconcile(req.order_no.trim(), req.force_gateway_query)
        .await?;
    Ok(Json(outcome))
}
