//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub public_url: String,

    // Database
    pub database_url: String,
    pub database_direct_url: Option<String>,

    // Feature flags
    pub enable_billing: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            public_url: env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL not set"))?,
            // Direct (non-pooled) URL for migrations; PgBouncer doesn't
            // support the prepared statements sqlx migrations use
            database_direct_url: env::var("DATABASE_DIRECT_URL").ok(),
            enable_billing: env::var("ENABLE_BILLING")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(true),
        })
    }
}
