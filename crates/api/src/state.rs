//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    /// Billing services (None when billing is disabled by configuration)
    pub billing: Option<Arc<opsuite_billing::BillingService>>,
}
