//! MeterPay billing reconciliation
//!
//! Detects drift between metered usage charges and the configured cost
//! policy, and repairs it against the account ledger with a full audit trail.

pub mod correction;
pub mod detector;
pub mod error;
pub mod notify;
pub mod policy;
pub mod sweep;

pub use correction::{plan_correction, CorrectionEngine, CorrectionOutcome, CorrectionPlan};
pub use detector::{evaluate_record, DetectionReport, MismatchDetector, SEVERE_DEVIATION_PCT};
pub use error::{BillingError, BillingResult};
pub use notify::OpsNotifier;
pub use policy::{load_cost_policy, CostPolicy, ExpectedCost};
pub use sweep::{run_sweep, DetectionSummary, SweepOptions};
