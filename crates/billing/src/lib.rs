// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Some provider operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Opsuite Billing Module
//!
//! Handles subscription billing against the payment provider.
//!
//! ## Features
//!
//! - **Plan Catalog**: Basic (a la carte) rates, feature modules, combo bundles
//! - **Pricing**: Deterministic quote computation with full component breakdown
//! - **Coupons**: Fail-closed validation with percentage/fixed discounts and caps
//! - **Subscription Lifecycle**: Create, reconfigure (prorated), cancel
//! - **Webhooks**: Verified, idempotent reconciliation of provider events
//! - **Audit Events**: Append-only record of every billing mutation

pub mod catalog;
pub mod client;
pub mod coupon;
pub mod error;
pub mod events;
pub mod gateway;
pub mod pricing;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
pub(crate) mod testing;


// Catalog
pub use catalog::{BasicPlanRates, ComboPlan, ModulePrice, PgPlanCatalog, PlanCatalog};

// Client
pub use client::{StripeClient, StripeConfig};

// Coupons
pub use coupon::{Coupon, CouponLookup, CouponOutcome, CouponStore, DiscountType, PgCouponStore};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{BillingEventSink, BillingEventType, PgBillingEventLog};

// Gateway
pub use gateway::{
    to_minor_units, PaymentGateway, ProviderSubscription, StripeGateway, UpcomingInvoice,
};

// Pricing
pub use pricing::{
    BasicQuoteParams, ModuleLine, PlanRef, PriceBreakdown, PricingCalculator, QuantityComponent,
};

// Store
pub use store::{BillingProfile, PgSubscriptionStore, SubscriptionRecord, SubscriptionStore};

// Subscriptions
pub use subscriptions::{
    CreateSubscriptionParams, CreateSubscriptionResult, PlanSelection, ProviderSubscriptionState,
    ReconfigureParams, SubscriptionService,
};

// Webhooks
pub use webhooks::{ProviderEvent, WebhookReconciler};

use std::sync::Arc;

use sqlx::PgPool;

/// Fully wired billing services over Postgres and Stripe
pub struct BillingService {
    pub pricing: PricingCalculator,
    pub subscriptions: Arc<SubscriptionService>,
    pub webhooks: WebhookReconciler,
}

impl BillingService {
    /// Wire the billing stack from environment configuration
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        let webhook_secret = stripe.config().webhook_secret.clone();
        let currency = stripe.config().currency.clone();

        let catalog: Arc<dyn PlanCatalog> = Arc::new(PgPlanCatalog::new(pool.clone()));
        let coupons: Arc<dyn CouponStore> = Arc::new(PgCouponStore::new(pool.clone()));
        let store: Arc<dyn SubscriptionStore> = Arc::new(PgSubscriptionStore::new(pool.clone()));
        let events: Arc<dyn BillingEventSink> = Arc::new(PgBillingEventLog::new(pool));
        let gateway: Arc<dyn PaymentGateway> = Arc::new(StripeGateway::new(stripe));

        let pricing = PricingCalculator::new(catalog, coupons.clone(), currency);
        let subscriptions = Arc::new(SubscriptionService::new(
            pricing.clone(),
            gateway,
            store,
            coupons,
            events,
        ));
        let webhooks = WebhookReconciler::new(webhook_secret, subscriptions.clone());

        Ok(Self {
            pricing,
            subscriptions,
            webhooks,
        })
    }
}
