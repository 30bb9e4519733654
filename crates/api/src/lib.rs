//! MeterPay API Library
//!
//! HTTP surface for the billing mismatch sweep and order reconciliation.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
