//! Operations-channel notification delivery
//!
//! Sends detection/correction summaries to an ops webhook. Best-effort:
//! callers dispatch this as a fire-and-forget task and only log failures.

use serde_json::json;

use crate::sweep::DetectionSummary;

/// Ops webhook notifier
#[derive(Clone)]
pub struct OpsNotifier {
    webhook_url: Option<String>,
}

impl OpsNotifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self { webhook_url }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var("OPS_WEBHOOK_URL").ok())
    }

    /// Whether a summary warrants a notification: new mismatches reached the
    /// threshold, or any corrections actually ran.
    pub fn should_notify(&self, summary: &DetectionSummary, mismatch_threshold: usize) -> bool {
        summary.new_mismatches_found >= mismatch_threshold.max(1)
            || summary.corrections_attempted > 0
    }

    /// Send the sweep summary to the ops channel.
    pub async fn send_summary(
        &self,
        summary: &DetectionSummary,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let Some(ref webhook_url) = self.webhook_url else {
            tracing::warn!("Ops webhook URL not configured, skipping notification");
            return Ok(());
        };

        let emoji = if summary.severe_mismatches > 0 {
            ":rotating_light:"
        } else {
            ":warning:"
        };

        let payload = json!({
            "text": format!("{} *Billing mismatch sweep*", emoji),
            "attachments": [{
                "color": if summary.severe_mismatches > 0 { "#FF0000" } else { "#FFA500" },
                "fields": [
                    {
                        "title": "Checked records",
                        "value": summary.checked_records.to_string(),
                        "short": true
                    },
                    {
                        "title": "New mismatches",
                        "value": summary.new_mismatches_found.to_string(),
                        "short": true
                    },
                    {
                        "title": "Severe (>50% deviation)",
                        "value": summary.severe_mismatches.to_string(),
                        "short": true
                    },
                    {
                        "title": "Corrections (ok/failed)",
                        "value": format!(
                            "{}/{}",
                            summary.corrections_successful, summary.corrections_failed
                        ),
                        "short": true
                    },
                    {
                        "title": "Affected features",
                        "value": if summary.affected_features.is_empty() {
                            "none".to_string()
                        } else {
                            summary.affected_features.join(", ")
                        },
                        "short": false
                    }
                ],
                "footer": "MeterPay billing monitor"
            }]
        });

        let client = reqwest::Client::new();
        let response = client.post(webhook_url).json(&payload).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::error!(
                status = %status,
                body = %body,
                "Failed to send ops notification"
            );
            return Err(format!("ops webhook returned {}: {}", status, body).into());
        }

        tracing::info!("Sent billing sweep summary to ops channel");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(new_mismatches: usize, attempted: usize) -> DetectionSummary {
        DetectionSummary {
            checked_records: 100,
            new_mismatches_found: new_mismatches,
            severe_mismatches: 0,
            pending_corrections: 0,
            corrections_attempted: attempted,
            corrections_successful: attempted,
            corrections_failed: 0,
            affected_features: vec![],
        }
    }

    #[test]
    fn notifies_on_new_mismatches_or_corrections() {
        let n = OpsNotifier::new(None);
        assert!(n.should_notify(&summary(3, 0), 1));
        assert!(n.should_notify(&summary(0, 2), 5));
        assert!(!n.should_notify(&summary(0, 0), 1));
        assert!(!n.should_notify(&summary(2, 0), 5));
    }
}
