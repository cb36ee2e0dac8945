//! Billing routes
//!
//! Thin verb-to-service mapping over the billing crate: quotes, subscription
//! lifecycle, and the inbound provider webhook endpoint.

use std::sync::Arc;

use axum::{
    extract::{FromRequestParts, State},
    http::{request::Parts, HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use opsuite_billing::{
    BasicQuoteParams, BillingService, CreateSubscriptionParams, PlanRef, PlanSelection,
    PriceBreakdown, ReconfigureParams, SubscriptionRecord,
};
use opsuite_shared::{BillingCycle, TenantId};

use crate::{error::ApiError, state::AppState};

/// Tenant identity, installed as a request header by the auth layer in
/// front of this service
pub struct AuthTenant(pub TenantId);

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthTenant
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-tenant-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<Uuid>().ok())
            .map(|id| AuthTenant(TenantId(id)))
            .ok_or(ApiError::Unauthorized)
    }
}

fn billing(state: &AppState) -> Result<&Arc<BillingService>, ApiError> {
    state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)
}

/// Quote request. The caller states which plan flow it is in; there is no
/// guessing from catalog contents.
#[derive(Debug, Deserialize)]
#[serde(tag = "plan", rename_all = "snake_case")]
pub enum QuoteRequest {
    Basic {
        users: u32,
        workspaces: u32,
        cycle: BillingCycle,
        #[serde(default)]
        module_ids: Vec<Uuid>,
        coupon_code: Option<String>,
    },
    Combo {
        plan_id: Uuid,
        cycle: BillingCycle,
        coupon_code: Option<String>,
    },
}

/// Compute a price breakdown without touching the provider
pub async fn quote(
    State(state): State<AppState>,
    _tenant: AuthTenant,
    Json(request): Json<QuoteRequest>,
) -> Result<Json<PriceBreakdown>, ApiError> {
    let billing = billing(&state)?;

    let breakdown = match request {
        QuoteRequest::Basic {
            users,
            workspaces,
            cycle,
            module_ids,
            coupon_code,
        } => {
            billing
                .pricing
                .quote_basic(&BasicQuoteParams {
                    users,
                    workspaces,
                    cycle,
                    module_ids,
                    coupon_code,
                })
                .await?
        }
        QuoteRequest::Combo {
            plan_id,
            cycle,
            coupon_code,
        } => {
            billing
                .pricing
                .quote_combo(plan_id, cycle, coupon_code.as_deref())
                .await?
        }
    };

    Ok(Json(breakdown))
}

/// Request to create a subscription
#[derive(Debug, Deserialize)]
pub struct CreateSubscriptionRequest {
    pub email: String,
    pub name: String,
    pub payment_method_id: String,
    pub coupon_code: Option<String>,
    #[serde(flatten)]
    pub plan: PlanRequest,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "plan", rename_all = "snake_case")]
pub enum PlanRequest {
    Basic {
        users: u32,
        workspaces: u32,
        cycle: BillingCycle,
        #[serde(default)]
        module_ids: Vec<Uuid>,
    },
    Combo {
        plan_id: Uuid,
        cycle: BillingCycle,
    },
}

impl PlanRequest {
    fn into_selection(self) -> PlanSelection {
        match self {
            PlanRequest::Basic {
                users,
                workspaces,
                cycle,
                module_ids,
            } => PlanSelection {
                plan: PlanRef::Basic,
                seats: users,
                workspaces,
                module_ids,
                cycle,
            },
            PlanRequest::Combo { plan_id, cycle } => PlanSelection {
                plan: PlanRef::Combo { id: plan_id },
                seats: 0,
                workspaces: 0,
                module_ids: vec![],
                cycle,
            },
        }
    }
}

/// Subscription info response
#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub id: Uuid,
    pub status: String,
    pub cycle: String,
    pub seats: i32,
    pub workspaces: i32,
    pub module_ids: Vec<Uuid>,
    pub cancel_at_period_end: bool,
    pub current_period_start: Option<String>,
    pub current_period_end: Option<String>,
    pub breakdown: PriceBreakdown,
    /// Present after creation when the provider requires on-session payment
    /// confirmation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_client_secret: Option<String>,
}

impl SubscriptionResponse {
    fn from_record(record: SubscriptionRecord, payment_client_secret: Option<String>) -> Self {
        let fmt = |t: time::OffsetDateTime| t.format(&Rfc3339).ok();
        Self {
            id: record.id,
            status: record.status.to_string(),
            cycle: record.cycle.to_string(),
            seats: record.seats,
            workspaces: record.workspaces,
            module_ids: record.module_ids,
            cancel_at_period_end: record.cancel_at_period_end,
            current_period_start: record.current_period_start.and_then(fmt),
            current_period_end: record.current_period_end.and_then(fmt),
            breakdown: record.breakdown,
            payment_client_secret,
        }
    }
}

/// Create a subscription for the authenticated tenant
pub async fn create_subscription(
    State(state): State<AppState>,
    AuthTenant(tenant_id): AuthTenant,
    Json(request): Json<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<SubscriptionResponse>), ApiError> {
    let billing = billing(&state)?;

    if request.payment_method_id.trim().is_empty() {
        return Err(ApiError::Validation("payment_method_id is required".to_string()));
    }

    let result = billing
        .subscriptions
        .create(CreateSubscriptionParams {
            tenant_id,
            email: request.email,
            name: request.name,
            payment_method_id: request.payment_method_id,
            selection: request.plan.into_selection(),
            coupon_code: request.coupon_code,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SubscriptionResponse::from_record(
            result.record,
            result.payment_client_secret,
        )),
    ))
}

/// The authenticated tenant's open subscription
pub async fn get_subscription(
    State(state): State<AppState>,
    AuthTenant(tenant_id): AuthTenant,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    let billing = billing(&state)?;

    let record = billing
        .subscriptions
        .current(tenant_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("no open subscription".to_string()))?;

    Ok(Json(SubscriptionResponse::from_record(record, None)))
}

/// Request to reconfigure a subscription. Omitted fields keep their current
/// values.
#[derive(Debug, Deserialize)]
pub struct ReconfigureRequest {
    pub users: Option<u32>,
    pub workspaces: Option<u32>,
    pub module_ids: Option<Vec<Uuid>>,
    pub cycle: Option<BillingCycle>,
    pub coupon_code: Option<String>,
}

/// Reconfigure the tenant's active subscription with proration
pub async fn reconfigure_subscription(
    State(state): State<AppState>,
    AuthTenant(tenant_id): AuthTenant,
    Json(request): Json<ReconfigureRequest>,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    let billing = billing(&state)?;

    let record = billing
        .subscriptions
        .reconfigure(
            tenant_id,
            ReconfigureParams {
                plan: None,
                seats: request.users,
                workspaces: request.workspaces,
                module_ids: request.module_ids,
                cycle: request.cycle,
                coupon_code: request.coupon_code,
            },
        )
        .await?;

    Ok(Json(SubscriptionResponse::from_record(record, None)))
}

/// Upcoming invoice preview response
#[derive(Debug, Serialize)]
pub struct UpcomingInvoiceResponse {
    pub amount_due_minor_units: i64,
    pub currency: String,
    pub period_end: Option<String>,
}

/// Preview the provider's next invoice for the tenant's subscription
pub async fn preview_upcoming_invoice(
    State(state): State<AppState>,
    AuthTenant(tenant_id): AuthTenant,
) -> Result<Json<UpcomingInvoiceResponse>, ApiError> {
    let billing = billing(&state)?;

    let invoice = billing
        .subscriptions
        .preview_upcoming_invoice(tenant_id)
        .await?;

    Ok(Json(UpcomingInvoiceResponse {
        amount_due_minor_units: invoice.amount_due_minor_units,
        currency: invoice.currency,
        period_end: invoice.period_end.and_then(|t| t.format(&Rfc3339).ok()),
    }))
}

/// Request to cancel a subscription
#[derive(Debug, Deserialize)]
pub struct CancelSubscriptionRequest {
    /// true: keep access until period end, then cancel; false: cancel now
    #[serde(default)]
    pub at_period_end: bool,
}

/// Cancel the tenant's subscription, immediately or at period end
pub async fn cancel_subscription(
    State(state): State<AppState>,
    AuthTenant(tenant_id): AuthTenant,
    Json(request): Json<CancelSubscriptionRequest>,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    let billing = billing(&state)?;

    let record = billing
        .subscriptions
        .cancel(tenant_id, request.at_period_end)
        .await?;

    Ok(Json(SubscriptionResponse::from_record(record, None)))
}

/// Handle provider webhook events
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    tracing::info!(body_len = body.len(), "Provider webhook received");

    let billing = billing(&state)?;

    // Get signature header
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Provider webhook missing signature header");
            ApiError::BadRequest("Missing webhook signature".to_string())
        })?;

    // Verification happens inside handle(), before any parsing; a bad
    // signature maps to 400 and never reaches the lifecycle manager
    billing.webhooks.handle(&body, signature).await?;

    Ok(StatusCode::OK)
}
