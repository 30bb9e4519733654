//! Order reconciliation
//!
//! Pull-based recovery for orders whose payment confirmation never arrived.
//! The database is consulted first; only a pending order with the force flag
//! goes out to the gateway. The pending -> paid transition is a conditional
//! update, so when two reconciliations race only one of them triggers the
//! benefit grant.

use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;

use meterpay_shared::{Order, OrderStatus, PackageKind, Subscription, TradeState};

use crate::error::{PaymentError, PaymentResult};
use crate::gateway::{GatewayClient, OrderProbe};
use crate::grants::{BenefitGranter, GrantSummary};

const GATEWAY_RETRY_DELAY_MS: u64 = 500;

/// Where the reported status came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileSource {
    Db,
    Gateway,
}

/// Result of one reconciliation pass over a single order.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileOutcome {
    pub order_no: String,
    pub status: OrderStatus,
    pub paid_at: Option<OffsetDateTime>,
    pub package_key: String,
    pub amount: i64,
    pub source: ReconcileSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_state: Option<TradeState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant: Option<GrantSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_error: Option<String>,
}

impl ReconcileOutcome {
    fn from_order(order: &Order, status: OrderStatus, source: ReconcileSource) -> Self {
        Self {
            order_no: order.order_no.clone(),
            status,
            paid_at: order.paid_at,
            package_key: order.package_key.clone(),
            amount: order.amount,
            source,
            trade_state: None,
            grant: None,
            gateway_error: None,
        }
    }
}

/// Reconciles individual orders against the payment provider.
#[derive(Clone)]
pub struct OrderReconciler {
    pool: PgPool,
    gateway: GatewayClient,
    granter: BenefitGranter,
}

impl OrderReconciler {
    pub fn new(pool: PgPool, gateway: GatewayClient) -> Self {
        let granter = BenefitGranter::new(pool.clone());
        Self {
            pool,
            gateway,
            granter,
        }
    }

    /// Reconcile one order. Paid orders short-circuit from the database;
    /// pending orders are verified against the gateway only when `force` is
    /// set. Unknown order numbers are an error.
    pub async fn reconcile(&self, order_no: &str, force: bool) -> PaymentResult<ReconcileOutcome> {
        let order = self
            .load_order(order_no)
            .await?
            .ok_or_else(|| PaymentError::OrderNotFound(order_no.to_string()))?;

        if order.is_paid() {
            self.heal_missing_subscription(&order).await;
            return Ok(ReconcileOutcome::from_order(
                &order,
                OrderStatus::Paid,
                ReconcileSource::Db,
            ));
        }

        if !force {
            return Ok(ReconcileOutcome::from_order(
                &order,
                OrderStatus::Pending,
                ReconcileSource::Db,
            ));
        }

        let probe = self.probe_with_retry(order_no).await;
        self.apply_probe(order, probe).await
    }

    /// Apply a gateway answer to a locally pending order. On a confirmed
    /// payment the conditional update decides which of any racing invocations
    /// performs the transition, and only that one grants. The outcome always
    /// reflects the persisted row, so repeated calls report the same
    /// `paid_at` and the grant sees the stored provider transaction id.
    pub async fn apply_probe(
        &self,
        order: Order,
        probe: OrderProbe,
    ) -> PaymentResult<ReconcileOutcome> {
        let mut outcome =
            ReconcileOutcome::from_order(&order, OrderStatus::Pending, ReconcileSource::Gateway);
        outcome.trade_state = probe.trade_state.clone();
        outcome.gateway_error = probe.error.clone();

        if !probe.is_paid() {
            tracing::info!(
                order_no = %order.order_no,
                trade_state = ?probe.trade_state,
                "Order not confirmed paid; left pending"
            );
            return Ok(outcome);
        }

        let transitioned = self
            .mark_paid(&order.order_no, probe.transaction_id.as_deref())
            .await?;

        // Re-read the row so the grant and the outcome carry the persisted
        // transition (stored paid_at and trade_no), not the stale pending
        // snapshot this call started from.
        let order = self.load_order(&order.order_no).await?.unwrap_or(order);
        outcome.status = OrderStatus::Paid;
        outcome.paid_at = order.paid_at;

        // Only the invocation that won the conditional update grants; the
        // loser sees the already-paid row and must not grant again.
        if transitioned {
            match self.granter.grant_for_order(&order).await {
                Ok(summary) => outcome.grant = Some(summary),
                Err(e) => {
                    tracing::error!(
                        order_no = %order.order_no,
                        error = %e,
                        "Benefit grant failed after payment confirmation; order stays paid"
                    );
                }
            }
        } else {
            tracing::info!(
                order_no = %order.order_no,
                "Order already transitioned by a concurrent path"
            );
        }

        Ok(outcome)
    }

    async fn load_order(&self, order_no: &str) -> PaymentResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(
            "SELECT id, order_no, user_id, package_key, amount, status, trade_no, paid_at, created_at
             FROM orders WHERE order_no = $1",
        )
        .bind(order_no)
        .fetch_optional(&self.pool)
        .await?;
        Ok(order)
    }

    /// One retry on an unavailable probe; a definitive gateway answer (paid
    /// or not) is returned as-is.
    async fn probe_with_retry(&self, order_no: &str) -> OrderProbe {
        let strategy = FixedInterval::from_millis(GATEWAY_RETRY_DELAY_MS).take(1);
        let attempt = || async {
            let probe = self.gateway.query_order(order_no).await;
            if probe.success {
                Ok(probe)
            } else {
                Err(probe)
            }
        };
        match Retry::spawn(strategy, attempt).await {
            Ok(probe) => probe,
            Err(probe) => probe,
        }
    }

    /// Conditional pending -> paid transition; returns whether this call
    /// performed it.
    async fn mark_paid(&self, order_no: &str, trade_no: Option<&str>) -> PaymentResult<bool> {
        let result = sqlx::query(
            "UPDATE orders
             SET status = 'paid', paid_at = NOW(), trade_no = COALESCE($2, trade_no)
             WHERE order_no = $1 AND status = 'pending'",
        )
        .bind(order_no)
        .bind(trade_no)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// A paid subscription order whose subscription row went missing (partial
    /// failure in an earlier grant) gets the row reconstructed. Best-effort.
    async fn heal_missing_subscription(&self, order: &Order) {
        if let Err(e) = self.try_heal_subscription(order).await {
            tracing::warn!(
                order_no = %order.order_no,
                error = %e,
                "Subscription self-heal failed"
            );
        }
    }

    async fn try_heal_subscription(&self, order: &Order) -> PaymentResult<()> {
        let kind: Option<(String,)> =
            sqlx::query_as("SELECT kind FROM packages WHERE package_key = $1")
                .bind(&order.package_key)
                .fetch_optional(&self.pool)
                .await?;
        let is_subscription = kind
            .map(|(k,)| k.parse::<PackageKind>() == Ok(PackageKind::Subscription))
            .unwrap_or(false);
        if !is_subscription {
            return Ok(());
        }

        let existing: Option<Subscription> = sqlx::query_as(
            "SELECT id, user_id, package_key, status, start_date, end_date
             FROM subscriptions WHERE user_id = $1",
        )
        .bind(order.user_id)
        .fetch_optional(&self.pool)
        .await?;
        if existing.is_some() {
            return Ok(());
        }

        tracing::warn!(
            order_no = %order.order_no,
            user_id = %order.user_id,
            "Paid subscription order without subscription row; re-granting"
        );
        self.granter.grant_for_order(order).await?;
        Ok(())
    }
}
