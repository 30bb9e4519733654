//! Common types used across MeterPay
//!
//! Row types mirror the datastore tables; external payloads are parsed into
//! these at the boundary instead of passing untyped JSON around.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Status enums
// =============================================================================

/// Order payment status. Transitions are monotonic: pending -> paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "paid" => Ok(OrderStatus::Paid),
            other => Err(format!("unknown order status: {}", other)),
        }
    }
}

/// Direction of a ledger correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionType {
    /// Account was undercharged; increase used_quota.
    Charge,
    /// Account was overcharged; decrease used_quota (floored at zero).
    Refund,
}

impl CorrectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrectionType::Charge => "charge",
            CorrectionType::Refund => "refund",
        }
    }

    /// Record type of the compensating usage entry written for auditability.
    pub fn usage_record_type(&self) -> &'static str {
        match self {
            CorrectionType::Charge => "correction_charge",
            CorrectionType::Refund => "correction_refund",
        }
    }
}

impl std::fmt::Display for CorrectionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of a cost alert, mutated only by the Correction Engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Pending,
    Corrected,
    Failed,
    Skipped,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Pending => "pending",
            AlertStatus::Corrected => "corrected",
            AlertStatus::Failed => "failed",
            AlertStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Trade state reported by the payment provider for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeState {
    Success,
    NotPay,
    UserPaying,
    Closed,
    Refund,
    /// Any state we don't model explicitly; treated as "not yet paid".
    Other(String),
}

impl TradeState {
    pub fn parse(s: &str) -> Self {
        match s {
            "SUCCESS" => TradeState::Success,
            "NOTPAY" => TradeState::NotPay,
            "USERPAYING" => TradeState::UserPaying,
            "CLOSED" => TradeState::Closed,
            "REFUND" => TradeState::Refund,
            other => TradeState::Other(other.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TradeState::Success)
    }
}

/// Entitlement category of a purchasable package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    /// Training-camp access; grants a camp purchase record.
    Camp,
    /// One-off quota top-up; grants additional total_quota.
    Quota,
    /// Time-boxed subscription; grants/extends the user's subscription row.
    Subscription,
}

impl FromStr for PackageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "camp" => Ok(PackageKind::Camp),
            "quota" => Ok(PackageKind::Quota),
            "subscription" => Ok(PackageKind::Subscription),
            other => Err(format!("unknown package kind: {}", other)),
        }
    }
}

// =============================================================================
// Ledger rows
// =============================================================================

/// Append-only metered usage entry. Immutable once written.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub record_type: String,
    /// Actual cost charged, in quota points.
    pub amount: i64,
    pub source: Option<String>,
    pub metadata: Value,
    pub created_at: OffsetDateTime,
}

impl UsageRecord {
    /// Feature key under which this record was charged, if resolvable.
    pub fn feature_key(&self) -> Option<&str> {
        self.metadata
            .get("feature_key")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .or(self.source.as_deref())
    }

    /// Whether this record consumed a free quota rather than paid points.
    pub fn used_free_quota(&self) -> bool {
        self.metadata
            .get("free_quota_used")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Source of the charged amount, e.g. "package_settings" or "explicit_amount".
    pub fn cost_source(&self) -> Option<&str> {
        self.metadata.get("cost_source").and_then(Value::as_str)
    }
}

/// Billing mismatch alert. At most one per usage record.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CostAlert {
    pub id: Uuid,
    pub user_id: Uuid,
    pub alert_type: String,
    pub usage_record_id: Uuid,
    pub expected_amount: i64,
    pub actual_amount: i64,
    pub correction_status: String,
    pub metadata: Value,
    pub created_at: OffsetDateTime,
}

impl CostAlert {
    pub fn status(&self) -> Option<AlertStatus> {
        match self.correction_status.as_str() {
            "pending" => Some(AlertStatus::Pending),
            "corrected" => Some(AlertStatus::Corrected),
            "failed" => Some(AlertStatus::Failed),
            "skipped" => Some(AlertStatus::Skipped),
            _ => None,
        }
    }

    pub fn feature_key(&self) -> Option<&str> {
        self.metadata.get("feature_key").and_then(Value::as_str)
    }
}

/// Immutable audit record of a ledger correction.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct BillingCorrection {
    pub id: Uuid,
    pub user_id: Uuid,
    pub alert_id: Uuid,
    pub correction_type: String,
    pub original_amount: i64,
    pub expected_amount: i64,
    pub correction_amount: i64,
    pub status: String,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

/// Per-user quota account. The contended resource: mutated by normal usage
/// and by corrections, so mutations must be atomic at the storage layer.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UserAccount {
    pub user_id: Uuid,
    pub total_quota: i64,
    pub used_quota: i64,
}

impl UserAccount {
    pub fn remaining_quota(&self) -> i64 {
        (self.total_quota - self.used_quota).max(0)
    }
}

// =============================================================================
// Order and entitlement rows
// =============================================================================

/// Payment order against the external provider.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub order_no: String,
    pub user_id: Uuid,
    pub package_key: String,
    /// Order amount in minor currency units.
    pub amount: i64,
    pub status: String,
    pub trade_no: Option<String>,
    pub paid_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl Order {
    pub fn order_status(&self) -> Option<OrderStatus> {
        self.status.parse().ok()
    }

    pub fn is_paid(&self) -> bool {
        self.order_status() == Some(OrderStatus::Paid)
    }
}

/// Configured purchasable package.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Package {
    pub package_key: String,
    pub display_name: String,
    pub kind: String,
    /// Quota points granted for quota-kind packages.
    pub grant_quota: Option<i64>,
    /// Subscription length for subscription-kind packages.
    pub duration_days: Option<i32>,
}

impl Package {
    pub fn package_kind(&self) -> Option<PackageKind> {
        self.kind.parse().ok()
    }
}

/// Single active subscription per user (upsert semantics).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub package_key: String,
    pub status: String,
    pub start_date: OffsetDateTime,
    pub end_date: OffsetDateTime,
}

/// Camp entitlement; at most one per (user, camp_type).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CampPurchase {
    pub id: Uuid,
    pub user_id: Uuid,
    pub camp_type: String,
    pub camp_name: String,
    pub purchase_price: i64,
    pub transaction_id: Option<String>,
    pub purchased_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(metadata: Value, source: Option<&str>) -> UsageRecord {
        UsageRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            record_type: "conversation".to_string(),
            amount: 5,
            source: source.map(String::from),
            metadata,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn feature_key_prefers_metadata_over_source() {
        let r = record(json!({"feature_key": "voice_chat"}), Some("legacy_source"));
        assert_eq!(r.feature_key(), Some("voice_chat"));
    }

    #[test]
    fn feature_key_falls_back_to_source() {
        let r = record(json!({}), Some("voice_chat"));
        assert_eq!(r.feature_key(), Some("voice_chat"));
        let r = record(json!({"feature_key": ""}), Some("voice_chat"));
        assert_eq!(r.feature_key(), Some("voice_chat"));
    }

    #[test]
    fn free_quota_flag_defaults_to_false() {
        let r = record(json!({}), None);
        assert!(!r.used_free_quota());
        let r = record(json!({"free_quota_used": true}), None);
        assert!(r.used_free_quota());
    }

    #[test]
    fn trade_state_parsing() {
        assert!(TradeState::parse("SUCCESS").is_success());
        assert_eq!(TradeState::parse("NOTPAY"), TradeState::NotPay);
        assert_eq!(
            TradeState::parse("PAYERROR"),
            TradeState::Other("PAYERROR".to_string())
        );
        assert!(!TradeState::parse("PAYERROR").is_success());
    }

    #[test]
    fn order_status_round_trip() {
        assert_eq!("paid".parse::<OrderStatus>().ok(), Some(OrderStatus::Paid));
        assert_eq!(OrderStatus::Pending.to_string(), "pending");
        assert!("refunded".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn remaining_quota_never_negative() {
        let acct = UserAccount {
            user_id: Uuid::new_v4(),
            total_quota: 10,
            used_quota: 25,
        };
        assert_eq!(acct.remaining_quota(), 0);
    }
}
