//! Opsuite API Server
//!
//! HTTP surface for the Opsuite platform: billing quotes, subscription
//! lifecycle, and the inbound payment-provider webhook endpoint.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
