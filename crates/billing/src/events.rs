//! Billing audit events
//!
//! Append-only record of billing mutations: answers "why is this tenant on
//! this plan?" long after the fact. Recording an event must never fail the
//! operation that produced it; sinks log and swallow their own errors.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use opsuite_shared::TenantId;

/// Types of billing audit events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingEventType {
    SubscriptionCreated,
    SubscriptionReconfigured,
    SubscriptionCancelRequested,
    SubscriptionCanceled,
    InvoicePaid,
    InvoicePaymentFailed,
    ProviderStateApplied,
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BillingEventType::SubscriptionCreated => "SUBSCRIPTION_CREATED",
            BillingEventType::SubscriptionReconfigured => "SUBSCRIPTION_RECONFIGURED",
            BillingEventType::SubscriptionCancelRequested => "SUBSCRIPTION_CANCEL_REQUESTED",
            BillingEventType::SubscriptionCanceled => "SUBSCRIPTION_CANCELED",
            BillingEventType::InvoicePaid => "INVOICE_PAID",
            BillingEventType::InvoicePaymentFailed => "INVOICE_PAYMENT_FAILED",
            BillingEventType::ProviderStateApplied => "PROVIDER_STATE_APPLIED",
        };
        write!(f, "{}", s)
    }
}

/// Destination for billing audit events
#[async_trait]
pub trait BillingEventSink: Send + Sync {
    async fn record(
        &self,
        tenant_id: TenantId,
        event_type: BillingEventType,
        provider_subscription_id: Option<&str>,
        data: Value,
    );
}

/// Postgres-backed audit log
pub struct PgBillingEventLog {
    pool: PgPool,
}

impl PgBillingEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillingEventSink for PgBillingEventLog {
    async fn record(
        &self,
        tenant_id: TenantId,
        event_type: BillingEventType,
        provider_subscription_id: Option<&str>,
        data: Value,
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO billing_events (id, tenant_id, event_type, provider_subscription_id, event_data)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id.0)
        .bind(event_type.to_string())
        .bind(provider_subscription_id)
        .bind(&data)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::error!(
                tenant_id = %tenant_id,
                event_type = %event_type,
                error = %e,
                "Failed to record billing event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_display() {
        assert_eq!(
            BillingEventType::SubscriptionCreated.to_string(),
            "SUBSCRIPTION_CREATED"
        );
        assert_eq!(BillingEventType::InvoicePaid.to_string(), "INVOICE_PAID");
        assert_eq!(
            BillingEventType::ProviderStateApplied.to_string(),
            "PROVIDER_STATE_APPLIED"
        );
    }
}
