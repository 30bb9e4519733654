//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,

    // Detection sweep
    /// Trailing window, in hours, the detector scans per sweep.
    pub detection_window_hours: i64,
    /// New-mismatch count at which a sweep summary is posted to ops.
    pub mismatch_alert_threshold: usize,

    // Ops notifications
    pub ops_webhook_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,

            // Detection sweep
            detection_window_hours: env::var("DETECTION_WINDOW_HOURS")
                .unwrap_or_else(|_| "24".to_string())
                .parse()
                .unwrap_or(24),
            mismatch_alert_threshold: env::var("MISMATCH_ALERT_THRESHOLD")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .unwrap_or(1),

            // Ops notifications
            ops_webhook_url: env::var("OPS_WEBHOOK_URL").ok(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
}
