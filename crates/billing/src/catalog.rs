//! Plan catalog
//!
//! Read-only lookup of basic-plan rates, feature module prices, and combo
//! plan bundles. All amounts are selected by billing cycle at the field
//! level: monthly and yearly prices are configured independently (annual
//! pricing is a commercial decision, not a 12x multiplier).

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use opsuite_shared::BillingCycle;

use crate::error::{BillingError, BillingResult};

/// Rates for the a-la-carte basic plan for one billing cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicPlanRates {
    pub base_price: Decimal,
    pub price_per_user: Decimal,
    pub price_per_workspace: Decimal,
}

/// A priced feature module, sellable standalone (basic) or bundled (combo)
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ModulePrice {
    pub id: Uuid,
    pub name: String,
    pub monthly_price: Decimal,
    pub yearly_price: Decimal,
}

impl ModulePrice {
    pub fn price_for(&self, cycle: BillingCycle) -> Decimal {
        match cycle {
            BillingCycle::Monthly => self.monthly_price,
            BillingCycle::Yearly => self.yearly_price,
        }
    }
}

/// A fixed bundle of modules at a flat price
#[derive(Debug, Clone)]
pub struct ComboPlan {
    pub id: Uuid,
    pub name: String,
    pub monthly_price: Decimal,
    pub yearly_price: Decimal,
    pub bundled_module_ids: Vec<Uuid>,
    pub user_limit: i32,
    pub workspace_limit: i32,
}

impl ComboPlan {
    pub fn price_for(&self, cycle: BillingCycle) -> Decimal {
        match cycle {
            BillingCycle::Monthly => self.monthly_price,
            BillingCycle::Yearly => self.yearly_price,
        }
    }
}

/// Catalog lookups consumed by the pricing calculator.
///
/// Injected rather than read from global tables so quotes are testable
/// without a database.
#[async_trait]
pub trait PlanCatalog: Send + Sync {
    /// Basic-plan rates for the given cycle
    async fn basic_rates(&self, cycle: BillingCycle) -> BillingResult<BasicPlanRates>;

    /// Resolve module prices by id. Fails with NotFound if any id is
    /// unknown or disabled; a quote must never silently drop a module.
    async fn modules(&self, ids: &[Uuid]) -> BillingResult<Vec<ModulePrice>>;

    /// Combo plan by id. Fails with NotFound if absent or disabled.
    async fn combo_plan(&self, id: Uuid) -> BillingResult<ComboPlan>;
}

/// Postgres-backed catalog
pub struct PgPlanCatalog {
    pool: PgPool,
}

impl PgPlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct BasicRatesRow {
    monthly_base_price: Decimal,
    monthly_price_per_user: Decimal,
    monthly_price_per_workspace: Decimal,
    yearly_base_price: Decimal,
    yearly_price_per_user: Decimal,
    yearly_price_per_workspace: Decimal,
}

#[derive(sqlx::FromRow)]
struct ComboPlanRow {
    id: Uuid,
    name: String,
    monthly_price: Decimal,
    yearly_price: Decimal,
    user_limit: i32,
    workspace_limit: i32,
}

#[async_trait]
impl PlanCatalog for PgPlanCatalog {
    async fn basic_rates(&self, cycle: BillingCycle) -> BillingResult<BasicPlanRates> {
        let row: Option<BasicRatesRow> = sqlx::query_as(
            r#"
            SELECT
                monthly_base_price,
                monthly_price_per_user,
                monthly_price_per_workspace,
                yearly_base_price,
                yearly_price_per_user,
                yearly_price_per_workspace
            FROM basic_plan_rates
            WHERE is_active = true
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| {
            BillingError::NotFound("no active basic plan rates configured".to_string())
        })?;

        Ok(match cycle {
            BillingCycle::Monthly => BasicPlanRates {
                base_price: row.monthly_base_price,
                price_per_user: row.monthly_price_per_user,
                price_per_workspace: row.monthly_price_per_workspace,
            },
            BillingCycle::Yearly => BasicPlanRates {
                base_price: row.yearly_base_price,
                price_per_user: row.yearly_price_per_user,
                price_per_workspace: row.yearly_price_per_workspace,
            },
        })
    }

    async fn modules(&self, ids: &[Uuid]) -> BillingResult<Vec<ModulePrice>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<ModulePrice> = sqlx::query_as(
            r#"
            SELECT id, name, monthly_price, yearly_price
            FROM modules
            WHERE id = ANY($1) AND is_active = true
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        if rows.len() != ids.len() {
            let found: std::collections::HashSet<Uuid> = rows.iter().map(|m| m.id).collect();
            let missing: Vec<String> = ids
                .iter()
                .filter(|id| !found.contains(id))
                .map(|id| id.to_string())
                .collect();
            return Err(BillingError::NotFound(format!(
                "unknown or disabled module(s): {}",
                missing.join(", ")
            )));
        }

        Ok(rows)
    }

    async fn combo_plan(&self, id: Uuid) -> BillingResult<ComboPlan> {
        let row: Option<ComboPlanRow> = sqlx::query_as(
            r#"
            SELECT id, name, monthly_price, yearly_price, user_limit, workspace_limit
            FROM combo_plans
            WHERE id = $1 AND is_active = true
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let row =
            row.ok_or_else(|| BillingError::NotFound(format!("combo plan not found: {}", id)))?;

        let module_ids: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT module_id FROM combo_plan_modules WHERE combo_plan_id = $1",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ComboPlan {
            id: row.id,
            name: row.name,
            monthly_price: row.monthly_price,
            yearly_price: row.yearly_price,
            bundled_module_ids: module_ids.into_iter().map(|(m,)| m).collect(),
            user_limit: row.user_limit,
            workspace_limit: row.workspace_limit,
        })
    }
}
