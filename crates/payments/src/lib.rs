//! MeterPay payment reconciliation
//!
//! Signed order-status queries against the payment provider, pull-based
//! reconciliation of stuck orders, and idempotent benefit grants once an
//! order is confirmed paid.

pub mod error;
pub mod gateway;
pub mod grants;
pub mod reconciler;
pub mod signer;

pub use error::{PaymentError, PaymentResult};
pub use gateway::{GatewayClient, GatewayConfig, OrderProbe};
pub use grants::{plan_benefit, BenefitGranter, GrantSummary, PlannedBenefit};
pub use reconciler::{OrderReconciler, ReconcileOutcome, ReconcileSource};
pub use signer::{RequestSigner, SignedRequest, SignerConfig, AUTH_SCHEME};
