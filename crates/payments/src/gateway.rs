//! Payment gateway client
//!
//! Issues a signed order-status query against the external payment provider,
//! directly or through an HTTP relay, and normalizes the answer into a small
//! typed probe. Read-only, with no retries or timeouts of its own; the caller
//! owns that policy. "Could not verify" is an in-band result, never an error:
//! missing credentials or a failed transport yield `success = false` and the
//! order simply stays pending.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use meterpay_shared::TradeState;

use crate::error::PaymentError;
use crate::signer::{RequestSigner, SignerConfig};

/// Gateway connection and signing configuration.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub merchant_id: Option<String>,
    pub serial_no: Option<String>,
    pub private_key_pem: Option<String>,
    /// Provider API base, e.g. `https://api.mch.weixin.qq.com`.
    pub api_base: String,
    /// Optional relay that forwards to the provider (for egress-restricted
    /// deployments); requests carry a bearer token.
    pub relay_url: Option<String>,
    pub relay_token: Option<String>,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        Self {
            merchant_id: std::env::var("GATEWAY_MCH_ID").ok(),
            serial_no: std::env::var("GATEWAY_CERT_SERIAL_NO").ok(),
            private_key_pem: std::env::var("GATEWAY_PRIVATE_KEY").ok(),
            api_base: std::env::var("GATEWAY_API_BASE")
                .unwrap_or_else(|_| "https://api.mch.weixin.qq.com".to_string()),
            relay_url: std::env::var("GATEWAY_RELAY_URL").ok(),
            relay_token: std::env::var("GATEWAY_RELAY_TOKEN").ok(),
        }
    }
}

/// Normalized result of one order-status query.
#[derive(Debug, Clone, Serialize)]
pub struct OrderProbe {
    pub success: bool,
    pub trade_state: Option<TradeState>,
    pub transaction_id: Option<String>,
    pub payer_ref: Option<String>,
    pub error: Option<String>,
}

impl OrderProbe {
    /// The gateway could not be consulted; callers must treat this as
    /// "could not verify", not as "not paid".
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            trade_state: None,
            transaction_id: None,
            payer_ref: None,
            error: Some(reason.into()),
        }
    }

    pub fn is_paid(&self) -> bool {
        self.success
            && self
                .trade_state
                .as_ref()
                .is_some_and(TradeState::is_success)
    }
}

/// Typed view of the provider's order-status payload; everything else in the
/// response is ignored at the boundary.
#[derive(Debug, Deserialize)]
struct ProviderOrderStatus {
    trade_state: Option<String>,
    transaction_id: Option<String>,
    payer: Option<ProviderPayer>,
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProviderPayer {
    openid: Option<String>,
}

/// Parse a provider response body into a probe.
pub fn probe_from_value(value: &Value) -> OrderProbe {
    let status: ProviderOrderStatus = match serde_json::from_value(value.clone()) {
        Ok(s) => s,
        Err(e) => return OrderProbe::unavailable(format!("unparseable provider response: {}", e)),
    };

    let Some(trade_state) = status.trade_state else {
        let detail = match (status.code, status.message) {
            (Some(code), Some(message)) => format!("{}: {}", code, message),
            (Some(code), None) => code,
            (None, Some(message)) => message,
            (None, None) => "provider response carried no trade_state".to_string(),
        };
        return OrderProbe::unavailable(detail);
    };

    OrderProbe {
        success: true,
        trade_state: Some(TradeState::parse(&trade_state)),
        transaction_id: status.transaction_id,
        payer_ref: status.payer.and_then(|p| p.openid),
        error: None,
    }
}

/// Unwrap the relay's envelope: `{error}` on failure, payload in `data` (or
/// the body itself) on success.
pub fn unwrap_relay_envelope(value: Value) -> Result<Value, String> {
    if let Some(error) = value.get("error").and_then(Value::as_str) {
        return Err(error.to_string());
    }
    Ok(value.get("data").cloned().unwrap_or(value))
}

/// Gateway query client
#[derive(Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> Self {
        Self::new(GatewayConfig::from_env())
    }

    /// Query the provider for one order's authoritative state.
    pub async fn query_order(&self, order_no: &str) -> OrderProbe {
        let (Some(merchant_id), Some(serial_no), Some(private_key_pem)) = (
            self.config.merchant_id.as_ref(),
            self.config.serial_no.as_ref(),
            self.config.private_key_pem.as_ref(),
        ) else {
            tracing::warn!(order_no, "Gateway credentials not configured; cannot verify order");
            return OrderProbe::unavailable("gateway credentials not configured");
        };

        let signer = match RequestSigner::new(&SignerConfig {
            merchant_id: merchant_id.clone(),
            serial_no: serial_no.clone(),
            private_key_pem: private_key_pem.clone(),
        }) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(order_no, error = %e, "Gateway signer unavailable");
                return OrderProbe::unavailable(e.to_string());
            }
        };

        let path = format!(
            "/v3/pay/transactions/out-trade-no/{}?mchid={}",
            order_no, merchant_id
        );
        let signed = signer.authorize("GET", &path, "");

        let response = match self.send(&path, &signed.authorization).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(order_no, error = %e, "Gateway query failed");
                return OrderProbe::unavailable(e.to_string());
            }
        };

        let probe = probe_from_value(&response);
        tracing::info!(
            order_no,
            success = probe.success,
            trade_state = ?probe.trade_state,
            "Gateway order probe"
        );
        probe
    }

    async fn send(&self, path: &str, authorization: &str) -> Result<Value, PaymentError> {
        let target_url = format!("{}{}", self.config.api_base, path);

        if let (Some(relay_url), Some(relay_token)) =
            (&self.config.relay_url, &self.config.relay_token)
        {
            let body = self
                .http
                .post(format!("{}/gateway-proxy", relay_url))
                .bearer_auth(relay_token)
                .json(&json!({
                    "target_url": target_url,
                    "method": "GET",
                    "headers": {
                        "Accept": "application/json",
                        "Authorization": authorization,
                    },
                }))
                .send()
                .await
                .map_err(|e| PaymentError::Gateway(format!("relay request failed: {}", e)))?
                .json::<Value>()
                .await
                .map_err(|e| PaymentError::Gateway(format!("relay response unreadable: {}", e)))?;

            return unwrap_relay_envelope(body).map_err(PaymentError::Gateway);
        }

        self.http
            .get(&target_url)
            .header("Accept", "application/json")
            .header("Authorization", authorization)
            .send()
            .await
            .map_err(|e| PaymentError::Gateway(format!("provider request failed: {}", e)))?
            .json::<Value>()
            .await
            .map_err(|e| PaymentError::Gateway(format!("provider response unreadable: {}", e)))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn successful_payment_probe() {
        let probe = probe_from_value(&json!({
            "trade_state": "SUCCESS",
            "transaction_id": "4200001234",
            "payer": {"openid": "o6_abc"}
        }));
        assert!(probe.is_paid());
        assert_eq!(probe.transaction_id.as_deref(), Some("4200001234"));
        assert_eq!(probe.payer_ref.as_deref(), Some("o6_abc"));
    }

    #[test]
    fn unpaid_trade_state_is_success_but_not_paid() {
        let probe = probe_from_value(&json!({"trade_state": "NOTPAY"}));
        assert!(probe.success);
        assert!(!probe.is_paid());
        assert_eq!(probe.trade_state, Some(TradeState::NotPay));
    }

    #[test]
    fn provider_error_body_is_unavailable() {
        let probe = probe_from_value(&json!({
            "code": "ORDER_NOT_EXIST",
            "message": "order does not exist"
        }));
        assert!(!probe.success);
        assert!(probe.error.as_deref().unwrap().contains("ORDER_NOT_EXIST"));
    }

    #[test]
    fn relay_envelope_unwraps_data_or_errors() {
        let ok = unwrap_relay_envelope(json!({"data": {"trade_state": "SUCCESS"}})).unwrap();
        assert_eq!(ok.get("trade_state").unwrap(), "SUCCESS");

        let passthrough = unwrap_relay_envelope(json!({"trade_state": "CLOSED"})).unwrap();
        assert_eq!(passthrough.get("trade_state").unwrap(), "CLOSED");

        let err = unwrap_relay_envelope(json!({"error": "upstream 502"}));
        assert_eq!(err.unwrap_err(), "upstream 502");
    }

    #[tokio::test]
    async fn missing_credentials_do_not_error() {
        let client = GatewayClient::new(GatewayConfig {
            api_base: "https://example.invalid".to_string(),
            ..Default::default()
        });
        let probe = client.query_order("ORDER1").await;
        assert!(!probe.success);
        assert!(probe.error.is_some());
        assert!(probe.trade_state.is_none());
    }
}
