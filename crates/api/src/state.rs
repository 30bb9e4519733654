//! Shared application state

use sqlx::PgPool;

use meterpay_billing::OpsNotifier;
use meterpay_payments::{GatewayClient, OrderReconciler};

use crate::config::Config;

/// State shared across all request handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub reconciler: OrderReconciler,
    pub notifier: OpsNotifier,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let reconciler = OrderReconciler::new(pool.clone(), GatewayClient::from_env());
        let notifier = OpsNotifier::new(config.ops_webhook_url.clone());
        Self {
            pool,
            config,
            reconciler,
            notifier,
        }
    }
}
