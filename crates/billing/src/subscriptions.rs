//! Subscription lifecycle management
//!
//! Orchestrates the pricing calculator, the payment gateway, and the local
//! subscription store. Local persistence happens only after the provider
//! call succeeds for creation and reconfiguration; deferred cancellation is
//! the one place the local flag is written optimistically, because the
//! provider remains authoritative for the final status.
//!
//! Webhook-driven state application is a pure copy of the provider's own
//! status/period fields (last writer wins), never counter arithmetic, so
//! replayed or reordered events cannot corrupt local state.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use opsuite_shared::{BillingCycle, SubscriptionStatus, TenantId};

use crate::coupon::CouponStore;
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventSink, BillingEventType};
use crate::gateway::{to_minor_units, PaymentGateway, UpcomingInvoice};
use crate::pricing::{BasicQuoteParams, PlanRef, PriceBreakdown, PricingCalculator};
use crate::store::{BillingProfile, SubscriptionRecord, SubscriptionStore};

/// The billing parameters a subscription is configured with
#[derive(Debug, Clone)]
pub struct PlanSelection {
    pub plan: PlanRef,
    pub seats: u32,
    pub workspaces: u32,
    pub module_ids: Vec<Uuid>,
    pub cycle: BillingCycle,
}

/// Parameters for creating a subscription
#[derive(Debug, Clone)]
pub struct CreateSubscriptionParams {
    pub tenant_id: TenantId,
    pub email: String,
    pub name: String,
    pub payment_method_id: String,
    pub selection: PlanSelection,
    pub coupon_code: Option<String>,
}

/// Result of creating a subscription
#[derive(Debug, Clone)]
pub struct CreateSubscriptionResult {
    pub record: SubscriptionRecord,
    /// Present when the provider requires on-session payment confirmation
    /// to move the subscription out of `incomplete`
    pub payment_client_secret: Option<String>,
}

/// Reconfiguration changes. Unspecified fields are retained from the
/// existing record.
#[derive(Debug, Clone, Default)]
pub struct ReconfigureParams {
    pub plan: Option<PlanRef>,
    pub seats: Option<u32>,
    pub workspaces: Option<u32>,
    pub module_ids: Option<Vec<Uuid>>,
    pub cycle: Option<BillingCycle>,
    pub coupon_code: Option<String>,
}

/// Provider-reported subscription state carried by webhook events. Only the
/// fields present in the event are applied; everything else is left alone.
#[derive(Debug, Clone)]
pub struct ProviderSubscriptionState {
    pub provider_subscription_id: String,
    pub status: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: Option<bool>,
}

/// Subscription lifecycle manager
pub struct SubscriptionService {
    pricing: PricingCalculator,
    gateway: Arc<dyn PaymentGateway>,
    store: Arc<dyn SubscriptionStore>,
    coupons: Arc<dyn CouponStore>,
    events: Arc<dyn BillingEventSink>,
    /// Serializes creation per tenant so two concurrent creates cannot both
    /// pass the single-open-subscription check. The store's unique insert is
    /// the cross-process backstop.
    tenant_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl SubscriptionService {
    pub fn new(
        pricing: PricingCalculator,
        gateway: Arc<dyn PaymentGateway>,
        store: Arc<dyn SubscriptionStore>,
        coupons: Arc<dyn CouponStore>,
        events: Arc<dyn BillingEventSink>,
    ) -> Self {
        Self {
            pricing,
            gateway,
            store,
            coupons,
            events,
            tenant_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_tenant(&self, tenant_id: TenantId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.tenant_locks.lock().await;
            locks
                .entry(tenant_id.0)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Create a subscription for a tenant.
    ///
    /// Rejects with `Conflict` before touching the provider if the tenant
    /// already holds an open (incomplete/active/past_due) subscription. On
    /// success the persisted record carries the provider's status and the
    /// quoted price breakdown snapshot.
    pub async fn create(
        &self,
        params: CreateSubscriptionParams,
    ) -> BillingResult<CreateSubscriptionResult> {
        let _guard = self.lock_tenant(params.tenant_id).await;

        if self.store.find_open_by_tenant(params.tenant_id).await?.is_some() {
            return Err(BillingError::Conflict(
                "tenant already has an active subscription".to_string(),
            ));
        }

        let customer_id = self
            .ensure_customer(params.tenant_id, &params.email, &params.name)
            .await?;

        self.attach_with_recovery(&params.payment_method_id, &customer_id)
            .await?;

        self.gateway
            .set_default_payment_method(&customer_id, &params.payment_method_id)
            .await?;
        self.store
            .save_billing_profile(
                params.tenant_id,
                &BillingProfile {
                    provider_customer_id: customer_id.clone(),
                    default_payment_method_id: Some(params.payment_method_id.clone()),
                },
            )
            .await?;

        let breakdown = self
            .quote(&params.selection, params.coupon_code.as_deref())
            .await?;

        let amount = to_minor_units(breakdown.total)?;
        let provider_sub = self
            .gateway
            .create_subscription(&customer_id, amount, params.selection.cycle)
            .await?;

        let status = SubscriptionStatus::from_provider(&provider_sub.status).unwrap_or_else(|| {
            tracing::warn!(
                provider_status = %provider_sub.status,
                "Provider returned unrecognized subscription status, treating as incomplete"
            );
            SubscriptionStatus::Incomplete
        });

        let now = OffsetDateTime::now_utc();
        let record = SubscriptionRecord {
            id: Uuid::new_v4(),
            tenant_id: params.tenant_id,
            plan: params.selection.plan,
            seats: params.selection.seats as i32,
            workspaces: params.selection.workspaces as i32,
            module_ids: params.selection.module_ids.clone(),
            cycle: params.selection.cycle,
            coupon_code: params.coupon_code.clone(),
            provider_customer_id: customer_id,
            provider_subscription_id: provider_sub.id.clone(),
            status,
            cancel_at_period_end: provider_sub.cancel_at_period_end,
            current_period_start: Some(provider_sub.current_period_start),
            current_period_end: Some(provider_sub.current_period_end),
            next_billing_at: Some(provider_sub.current_period_end),
            breakdown: breakdown.clone(),
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = self.store.insert(&record).await {
            // The provider subscription exists but local persistence failed;
            // this needs manual reconciliation, never a silent retry
            tracing::error!(
                tenant_id = %params.tenant_id,
                provider_subscription_id = %provider_sub.id,
                error = %e,
                "Provider subscription created but local insert failed"
            );
            return Err(e);
        }

        if breakdown.coupon.applied {
            if let Some(code) = &params.coupon_code {
                self.coupons.record_use(code).await?;
            }
        }

        self.events
            .record(
                params.tenant_id,
                BillingEventType::SubscriptionCreated,
                Some(&provider_sub.id),
                json!({
                    "status": status.as_str(),
                    "total": breakdown.total,
                    "cycle": params.selection.cycle.as_str(),
                }),
            )
            .await;

        tracing::info!(
            tenant_id = %params.tenant_id,
            subscription_id = %record.id,
            provider_subscription_id = %provider_sub.id,
            status = %status,
            "Created subscription"
        );

        Ok(CreateSubscriptionResult {
            record,
            payment_client_secret: provider_sub.latest_invoice_client_secret,
        })
    }

    /// Reconfigure the tenant's subscription (seats, workspaces, modules,
    /// cycle, plan). Permitted only while the subscription is active and no
    /// deferred cancellation is pending. The provider price is updated with
    /// proration; webhook reconciliation never reaches this path.
    pub async fn reconfigure(
        &self,
        tenant_id: TenantId,
        changes: ReconfigureParams,
    ) -> BillingResult<SubscriptionRecord> {
        let mut record = self
            .store
            .find_open_by_tenant(tenant_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("no open subscription for tenant".to_string()))?;

        if record.status != SubscriptionStatus::Active {
            return Err(BillingError::Conflict(format!(
                "subscription is {}; only active subscriptions can be reconfigured",
                record.status
            )));
        }
        if record.cancel_at_period_end {
            return Err(BillingError::Conflict(
                "cancellation is pending; reconfiguration is not allowed".to_string(),
            ));
        }

        let selection = PlanSelection {
            plan: changes.plan.unwrap_or(record.plan),
            seats: changes.seats.unwrap_or(record.seats as u32),
            workspaces: changes.workspaces.unwrap_or(record.workspaces as u32),
            module_ids: changes.module_ids.unwrap_or_else(|| record.module_ids.clone()),
            cycle: changes.cycle.unwrap_or(record.cycle),
        };
        let coupon_code = changes.coupon_code.or_else(|| record.coupon_code.clone());

        let breakdown = self.quote(&selection, coupon_code.as_deref()).await?;

        let amount = to_minor_units(breakdown.total)?;
        let provider_sub = self
            .gateway
            .update_subscription_price(&record.provider_subscription_id, amount, selection.cycle)
            .await?;

        record.plan = selection.plan;
        record.seats = selection.seats as i32;
        record.workspaces = selection.workspaces as i32;
        record.module_ids = selection.module_ids;
        record.cycle = selection.cycle;
        record.coupon_code = coupon_code;
        record.breakdown = breakdown.clone();
        if let Some(status) = SubscriptionStatus::from_provider(&provider_sub.status) {
            record.status = status;
        }
        record.current_period_start = Some(provider_sub.current_period_start);
        record.current_period_end = Some(provider_sub.current_period_end);
        record.next_billing_at = Some(provider_sub.current_period_end);
        record.updated_at = OffsetDateTime::now_utc();

        self.store.update(&record).await?;

        self.events
            .record(
                tenant_id,
                BillingEventType::SubscriptionReconfigured,
                Some(&record.provider_subscription_id),
                json!({
                    "total": breakdown.total,
                    "cycle": record.cycle.as_str(),
                }),
            )
            .await;

        tracing::info!(
            tenant_id = %tenant_id,
            subscription_id = %record.id,
            total = %breakdown.total,
            "Reconfigured subscription"
        );

        Ok(record)
    }

    /// Cancel the tenant's subscription.
    ///
    /// Immediate cancellation transitions to `canceled` now and reverts the
    /// tenant to the free tier. Deferred cancellation sets the local flag
    /// optimistically before the provider call; the status flips only when
    /// the provider's period-end event arrives.
    pub async fn cancel(
        &self,
        tenant_id: TenantId,
        at_period_end: bool,
    ) -> BillingResult<SubscriptionRecord> {
        let mut record = self
            .store
            .find_open_by_tenant(tenant_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("no open subscription for tenant".to_string()))?;

        if at_period_end {
            record.cancel_at_period_end = true;
            record.updated_at = OffsetDateTime::now_utc();
            self.store.update(&record).await?;

            let provider_sub = self
                .gateway
                .cancel_subscription(&record.provider_subscription_id, true)
                .await?;
            record.cancel_at_period_end = provider_sub.cancel_at_period_end;
            record.current_period_end = Some(provider_sub.current_period_end);
            record.updated_at = OffsetDateTime::now_utc();
            self.store.update(&record).await?;

            self.events
                .record(
                    tenant_id,
                    BillingEventType::SubscriptionCancelRequested,
                    Some(&record.provider_subscription_id),
                    json!({ "at_period_end": true }),
                )
                .await;

            tracing::info!(
                tenant_id = %tenant_id,
                subscription_id = %record.id,
                "Subscription will cancel at period end"
            );
        } else {
            let provider_sub = self
                .gateway
                .cancel_subscription(&record.provider_subscription_id, false)
                .await?;

            record.status = SubscriptionStatus::from_provider(&provider_sub.status)
                .unwrap_or(SubscriptionStatus::Canceled);
            record.cancel_at_period_end = false;
            record.current_period_end = Some(provider_sub.current_period_end);
            record.updated_at = OffsetDateTime::now_utc();
            self.store.update(&record).await?;
            self.store.reset_tenant_plan(tenant_id).await?;

            self.events
                .record(
                    tenant_id,
                    BillingEventType::SubscriptionCanceled,
                    Some(&record.provider_subscription_id),
                    json!({ "at_period_end": false }),
                )
                .await;

            tracing::info!(
                tenant_id = %tenant_id,
                subscription_id = %record.id,
                "Cancelled subscription immediately"
            );
        }

        Ok(record)
    }

    /// The tenant's open subscription, if any
    pub async fn current(&self, tenant_id: TenantId) -> BillingResult<Option<SubscriptionRecord>> {
        self.store.find_open_by_tenant(tenant_id).await
    }

    /// Preview the provider's next invoice for the tenant's open
    /// subscription (read-only, safe to call repeatedly)
    pub async fn preview_upcoming_invoice(
        &self,
        tenant_id: TenantId,
    ) -> BillingResult<UpcomingInvoice> {
        let record = self
            .store
            .find_open_by_tenant(tenant_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("no open subscription for tenant".to_string()))?;

        self.gateway
            .preview_upcoming_invoice(&record.provider_subscription_id)
            .await
    }

    // =========================================================================
    // Webhook-driven reconciliation
    // =========================================================================
    // Each handler is a pure status/period-field update matched by provider
    // subscription id. Events for unknown ids are logged and dropped: the
    // provider may replay events long after local data has been purged.

    /// Apply a provider `subscription.updated` event
    pub async fn apply_subscription_updated(
        &self,
        state: ProviderSubscriptionState,
    ) -> BillingResult<()> {
        let Some(mut record) = self
            .store
            .find_by_provider_id(&state.provider_subscription_id)
            .await?
        else {
            return Self::drop_unknown(&state.provider_subscription_id, "subscription.updated");
        };

        let was_canceled = record.status == SubscriptionStatus::Canceled;

        if let Some(status_str) = &state.status {
            match SubscriptionStatus::from_provider(status_str) {
                Some(status) => record.status = status,
                None => {
                    tracing::warn!(
                        provider_subscription_id = %state.provider_subscription_id,
                        provider_status = %status_str,
                        "Ignoring unrecognized provider status"
                    );
                }
            }
        }
        if let Some(start) = state.current_period_start {
            record.current_period_start = Some(start);
        }
        if let Some(end) = state.current_period_end {
            record.current_period_end = Some(end);
            record.next_billing_at = Some(end);
        }
        if let Some(flag) = state.cancel_at_period_end {
            record.cancel_at_period_end = flag;
        }
        record.updated_at = OffsetDateTime::now_utc();

        self.store.update(&record).await?;

        if record.status == SubscriptionStatus::Canceled && !was_canceled {
            self.store.reset_tenant_plan(record.tenant_id).await?;
        }

        self.events
            .record(
                record.tenant_id,
                BillingEventType::ProviderStateApplied,
                Some(&state.provider_subscription_id),
                json!({ "status": record.status.as_str() }),
            )
            .await;

        Ok(())
    }

    /// Apply a provider `subscription.deleted` event
    pub async fn apply_subscription_deleted(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<()> {
        let Some(mut record) = self
            .store
            .find_by_provider_id(provider_subscription_id)
            .await?
        else {
            return Self::drop_unknown(provider_subscription_id, "subscription.deleted");
        };

        let was_canceled = record.status == SubscriptionStatus::Canceled;
        record.status = SubscriptionStatus::Canceled;
        record.updated_at = OffsetDateTime::now_utc();
        self.store.update(&record).await?;

        if !was_canceled {
            self.store.reset_tenant_plan(record.tenant_id).await?;
        }

        self.events
            .record(
                record.tenant_id,
                BillingEventType::SubscriptionCanceled,
                Some(provider_subscription_id),
                json!({ "source": "webhook" }),
            )
            .await;

        tracing::info!(
            tenant_id = %record.tenant_id,
            provider_subscription_id = %provider_subscription_id,
            "Subscription canceled by provider"
        );

        Ok(())
    }

    /// Apply a provider `invoice.payment_succeeded` event
    pub async fn apply_invoice_payment_succeeded(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<()> {
        let Some(mut record) = self
            .store
            .find_by_provider_id(provider_subscription_id)
            .await?
        else {
            return Self::drop_unknown(provider_subscription_id, "invoice.payment_succeeded");
        };

        // Payment clears dunning and activates incomplete subscriptions; a
        // canceled subscription stays canceled (a final invoice can settle
        // after cancellation)
        if record.status != SubscriptionStatus::Canceled {
            record.status = SubscriptionStatus::Active;
        }
        record.updated_at = OffsetDateTime::now_utc();
        self.store.update(&record).await?;

        self.events
            .record(
                record.tenant_id,
                BillingEventType::InvoicePaid,
                Some(provider_subscription_id),
                json!({}),
            )
            .await;

        Ok(())
    }

    /// Apply a provider `invoice.payment_failed` event
    pub async fn apply_invoice_payment_failed(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<()> {
        let Some(mut record) = self
            .store
            .find_by_provider_id(provider_subscription_id)
            .await?
        else {
            return Self::drop_unknown(provider_subscription_id, "invoice.payment_failed");
        };

        if record.status != SubscriptionStatus::Canceled {
            record.status = SubscriptionStatus::PastDue;
        }
        record.updated_at = OffsetDateTime::now_utc();
        self.store.update(&record).await?;

        self.events
            .record(
                record.tenant_id,
                BillingEventType::InvoicePaymentFailed,
                Some(provider_subscription_id),
                json!({}),
            )
            .await;

        tracing::warn!(
            tenant_id = %record.tenant_id,
            provider_subscription_id = %provider_subscription_id,
            "Invoice payment failed, subscription past due"
        );

        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn ensure_customer(
        &self,
        tenant_id: TenantId,
        email: &str,
        name: &str,
    ) -> BillingResult<String> {
        if let Some(profile) = self.store.billing_profile(tenant_id).await? {
            return Ok(profile.provider_customer_id);
        }

        let customer_id = self.gateway.create_customer(email, name).await?;
        self.store
            .save_billing_profile(
                tenant_id,
                &BillingProfile {
                    provider_customer_id: customer_id.clone(),
                    default_payment_method_id: None,
                },
            )
            .await?;

        Ok(customer_id)
    }

    /// Attach a payment method, recovering once from the stale-attachment
    /// race: if the provider reports the method attached elsewhere (or not
    /// attached at all), detach it and retry the attach exactly once. A
    /// NotAttached failure on the detach is swallowed; any other error, on
    /// either call, propagates. This is the only retry in the subsystem.
    async fn attach_with_recovery(&self, method_id: &str, customer_id: &str) -> BillingResult<()> {
        match self.gateway.attach_payment_method(method_id, customer_id).await {
            Ok(()) => Ok(()),
            Err(
                BillingError::PaymentMethodAlreadyAttached | BillingError::PaymentMethodNotAttached,
            ) => {
                tracing::warn!(
                    payment_method_id = %method_id,
                    "Payment method attach conflicted, detaching and retrying once"
                );
                match self.gateway.detach_payment_method(method_id).await {
                    Ok(()) | Err(BillingError::PaymentMethodNotAttached) => {}
                    Err(e) => return Err(e),
                }
                self.gateway.attach_payment_method(method_id, customer_id).await
            }
            Err(e) => Err(e),
        }
    }

    async fn quote(
        &self,
        selection: &PlanSelection,
        coupon_code: Option<&str>,
    ) -> BillingResult<PriceBreakdown> {
        match selection.plan {
            PlanRef::Basic => {
                self.pricing
                    .quote_basic(&BasicQuoteParams {
                        users: selection.seats,
                        workspaces: selection.workspaces,
                        cycle: selection.cycle,
                        module_ids: selection.module_ids.clone(),
                        coupon_code: coupon_code.map(str::to_string),
                    })
                    .await
            }
            PlanRef::Combo { id } => {
                self.pricing
                    .quote_combo(id, selection.cycle, coupon_code)
                    .await
            }
        }
    }

    fn drop_unknown(provider_subscription_id: &str, event: &str) -> BillingResult<()> {
        tracing::info!(
            provider_subscription_id = %provider_subscription_id,
            event = %event,
            "Event for unknown provider subscription, dropping"
        );
        Ok(())
    }
}
