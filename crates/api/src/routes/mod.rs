//! API route registration

pub mod billing;
pub mod health;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        // Billing
        .route("/api/billing/quote", post(billing::quote))
        .route(
            "/api/billing/subscription",
            post(billing::create_subscription)
                .get(billing::get_subscription)
                .patch(billing::reconfigure_subscription),
        )
        .route(
            "/api/billing/subscription/cancel",
            post(billing::cancel_subscription),
        )
        .route(
            "/api/billing/subscription/upcoming-invoice",
            get(billing::preview_upcoming_invoice),
        )
        // Inbound provider events
        .route("/api/billing/webhooks/provider", post(billing::webhook))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
