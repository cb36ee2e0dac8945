//! Subscription persistence
//!
//! A tenant has at most one open subscription (incomplete, active or
//! past_due). The store backs that invariant with a partial unique index so
//! two racing creates cannot both slip past the application-level check.
//! Canceled subscriptions are kept, never deleted: they are billing history.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use opsuite_shared::{BillingCycle, SubscriptionStatus, TenantId};

use crate::error::{BillingError, BillingResult};
use crate::pricing::{PlanRef, PriceBreakdown};

/// Provider identifiers cached on the tenant. Opaque handles owned by the
/// payment provider; nothing here interprets their structure.
#[derive(Debug, Clone)]
pub struct BillingProfile {
    pub provider_customer_id: String,
    pub default_payment_method_id: Option<String>,
}

/// A persisted subscription
#[derive(Debug, Clone)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub plan: PlanRef,
    pub seats: i32,
    pub workspaces: i32,
    pub module_ids: Vec<Uuid>,
    pub cycle: BillingCycle,
    pub coupon_code: Option<String>,
    pub provider_customer_id: String,
    pub provider_subscription_id: String,
    pub status: SubscriptionStatus,
    pub cancel_at_period_end: bool,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub next_billing_at: Option<OffsetDateTime>,
    /// Snapshot of the breakdown the subscription was last priced at.
    /// Audit/history data; webhook reconciliation never touches it.
    pub breakdown: PriceBreakdown,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Subscription and tenant-billing persistence consumed by the lifecycle
/// manager
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Insert a new subscription. Fails with `Conflict` if the tenant
    /// already holds an open subscription (unique-constraint-backed).
    async fn insert(&self, record: &SubscriptionRecord) -> BillingResult<()>;

    /// The tenant's open subscription, if any
    async fn find_open_by_tenant(
        &self,
        tenant_id: TenantId,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Look up by the provider's subscription id (webhook reconciliation path)
    async fn find_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Persist the record as-is (last writer wins)
    async fn update(&self, record: &SubscriptionRecord) -> BillingResult<()>;

    async fn billing_profile(&self, tenant_id: TenantId) -> BillingResult<Option<BillingProfile>>;

    async fn save_billing_profile(
        &self,
        tenant_id: TenantId,
        profile: &BillingProfile,
    ) -> BillingResult<()>;

    /// Revert the tenant's package designation to the free tier. Called when
    /// a subscription reaches `canceled`.
    async fn reset_tenant_plan(&self, tenant_id: TenantId) -> BillingResult<()>;
}

/// Postgres-backed subscription store
pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    tenant_id: Uuid,
    plan_kind: String,
    combo_plan_id: Option<Uuid>,
    seats: i32,
    workspaces: i32,
    module_ids: Vec<Uuid>,
    billing_cycle: String,
    coupon_code: Option<String>,
    provider_customer_id: String,
    provider_subscription_id: String,
    status: String,
    cancel_at_period_end: bool,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    next_billing_at: Option<OffsetDateTime>,
    breakdown: serde_json::Value,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl SubscriptionRow {
    fn into_record(self) -> BillingResult<SubscriptionRecord> {
        let plan = match (self.plan_kind.as_str(), self.combo_plan_id) {
            ("basic", _) => PlanRef::Basic,
            ("combo", Some(id)) => PlanRef::Combo { id },
            (kind, _) => {
                return Err(BillingError::Internal(format!(
                    "subscription {} has malformed plan kind {:?}",
                    self.id, kind
                )))
            }
        };

        let cycle = BillingCycle::parse(&self.billing_cycle).ok_or_else(|| {
            BillingError::Internal(format!(
                "subscription {} has unknown billing cycle {:?}",
                self.id, self.billing_cycle
            ))
        })?;

        let status = SubscriptionStatus::from_provider(&self.status).ok_or_else(|| {
            BillingError::Internal(format!(
                "subscription {} has unknown status {:?}",
                self.id, self.status
            ))
        })?;

        let breakdown: PriceBreakdown = serde_json::from_value(self.breakdown).map_err(|e| {
            BillingError::Internal(format!(
                "subscription {} has unreadable breakdown snapshot: {}",
                self.id, e
            ))
        })?;

        Ok(SubscriptionRecord {
            id: self.id,
            tenant_id: TenantId(self.tenant_id),
            plan,
            seats: self.seats,
            workspaces: self.workspaces,
            module_ids: self.module_ids,
            cycle,
            coupon_code: self.coupon_code,
            provider_customer_id: self.provider_customer_id,
            provider_subscription_id: self.provider_subscription_id,
            status,
            cancel_at_period_end: self.cancel_at_period_end,
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            next_billing_at: self.next_billing_at,
            breakdown,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn plan_columns(plan: &PlanRef) -> (&'static str, Option<Uuid>) {
    match plan {
        PlanRef::Basic => ("basic", None),
        PlanRef::Combo { id } => ("combo", Some(*id)),
    }
}

const SELECT_COLUMNS: &str = r#"
    id, tenant_id, plan_kind, combo_plan_id, seats, workspaces, module_ids,
    billing_cycle, coupon_code, provider_customer_id, provider_subscription_id,
    status, cancel_at_period_end, current_period_start, current_period_end,
    next_billing_at, breakdown, created_at, updated_at
"#;

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn insert(&self, record: &SubscriptionRecord) -> BillingResult<()> {
        let (plan_kind, combo_plan_id) = plan_columns(&record.plan);
        let breakdown = serde_json::to_value(&record.breakdown)
            .map_err(|e| BillingError::Internal(format!("breakdown serialization: {}", e)))?;

        // The partial unique index on (tenant_id) WHERE status is open turns
        // a double-create race into a 23505, mapped to Conflict
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, tenant_id, plan_kind, combo_plan_id, seats, workspaces,
                module_ids, billing_cycle, coupon_code, provider_customer_id,
                provider_subscription_id, status, cancel_at_period_end,
                current_period_start, current_period_end, next_billing_at,
                breakdown, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(record.id)
        .bind(record.tenant_id.0)
        .bind(plan_kind)
        .bind(combo_plan_id)
        .bind(record.seats)
        .bind(record.workspaces)
        .bind(&record.module_ids)
        .bind(record.cycle.as_str())
        .bind(&record.coupon_code)
        .bind(&record.provider_customer_id)
        .bind(&record.provider_subscription_id)
        .bind(record.status.as_str())
        .bind(record.cancel_at_period_end)
        .bind(record.current_period_start)
        .bind(record.current_period_end)
        .bind(record.next_billing_at)
        .bind(breakdown)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_open_by_tenant(
        &self,
        tenant_id: TenantId,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM subscriptions
             WHERE tenant_id = $1 AND status IN ('incomplete', 'active', 'past_due')"
        ))
        .bind(tenant_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionRow::into_record).transpose()
    }

    async fn find_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM subscriptions WHERE provider_subscription_id = $1"
        ))
        .bind(provider_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(SubscriptionRow::into_record).transpose()
    }

    async fn update(&self, record: &SubscriptionRecord) -> BillingResult<()> {
        let (plan_kind, combo_plan_id) = plan_columns(&record.plan);
        let breakdown = serde_json::to_value(&record.breakdown)
            .map_err(|e| BillingError::Internal(format!("breakdown serialization: {}", e)))?;

        sqlx::query(
            r#"
            UPDATE subscriptions SET
                plan_kind = $2,
                combo_plan_id = $3,
                seats = $4,
                workspaces = $5,
                module_ids = $6,
                billing_cycle = $7,
                coupon_code = $8,
                status = $9,
                cancel_at_period_end = $10,
                current_period_start = $11,
                current_period_end = $12,
                next_billing_at = $13,
                breakdown = $14,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(plan_kind)
        .bind(combo_plan_id)
        .bind(record.seats)
        .bind(record.workspaces)
        .bind(&record.module_ids)
        .bind(record.cycle.as_str())
        .bind(&record.coupon_code)
        .bind(record.status.as_str())
        .bind(record.cancel_at_period_end)
        .bind(record.current_period_start)
        .bind(record.current_period_end)
        .bind(record.next_billing_at)
        .bind(breakdown)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn billing_profile(&self, tenant_id: TenantId) -> BillingResult<Option<BillingProfile>> {
        let row: Option<(Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT provider_customer_id, default_payment_method_id FROM tenants WHERE id = $1",
        )
        .bind(tenant_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((Some(customer_id), default_payment_method_id)) => Some(BillingProfile {
                provider_customer_id: customer_id,
                default_payment_method_id,
            }),
            _ => None,
        })
    }

    async fn save_billing_profile(
        &self,
        tenant_id: TenantId,
        profile: &BillingProfile,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE tenants
            SET provider_customer_id = $2,
                default_payment_method_id = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(tenant_id.0)
        .bind(&profile.provider_customer_id)
        .bind(&profile.default_payment_method_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!("tenant not found: {}", tenant_id)));
        }

        Ok(())
    }

    async fn reset_tenant_plan(&self, tenant_id: TenantId) -> BillingResult<()> {
        sqlx::query("UPDATE tenants SET plan_tier = 'free', updated_at = NOW() WHERE id = $1")
            .bind(tenant_id.0)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
