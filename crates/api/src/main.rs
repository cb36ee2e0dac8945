//! Opsuite API server entrypoint

use std::sync::Arc;

use opsuite_shared::{create_migration_pool, create_pool};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use opsuite_api::{config::Config, routes::create_router, state::AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,opsuite_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Opsuite API Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    // Create database pool (using pooler URL for regular queries)
    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    // Run migrations using the direct URL (bypasses PgBouncer, which doesn't
    // support the prepared statements migrations rely on)
    tracing::info!("Running database migrations...");
    let migration_url = config
        .database_direct_url
        .as_ref()
        .unwrap_or(&config.database_url);
    let migration_pool = create_migration_pool(migration_url).await?;
    opsuite_shared::run_migrations(&migration_pool).await?;
    migration_pool.close().await;
    tracing::info!("Migrations complete");

    // Wire billing services
    let billing = if config.enable_billing {
        match opsuite_billing::BillingService::from_env(pool.clone()) {
            Ok(service) => {
                tracing::info!("Billing services initialized");
                Some(Arc::new(service))
            }
            Err(e) => {
                tracing::error!(error = %e, "Billing configuration invalid, billing disabled");
                None
            }
        }
    } else {
        tracing::warn!("Billing disabled by configuration");
        None
    };

    let state = AppState {
        pool,
        config: config.clone(),
        billing,
    };

    let app = create_router(state);

    tracing::info!(bind_address = %config.bind_address, "Listening");
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
