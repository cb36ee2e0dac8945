//! Pricing calculator
//!
//! Composes the plan catalog and the coupon validator into a full price
//! breakdown for a basic or combo request. Every component and its unit
//! price is retained in the breakdown; the breakdown is also what gets
//! persisted on the subscription as the audit snapshot.
//!
//! All amounts through this layer are decimal currency units. Conversion to
//! minor units happens once, at the payment gateway boundary, so rounding
//! error never compounds across the additive terms.

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use opsuite_shared::BillingCycle;

use crate::catalog::PlanCatalog;
use crate::coupon::{self, CouponLookup, CouponOutcome, CouponStore};
use crate::error::BillingResult;

/// Which kind of plan a request is for. The caller already knows which flow
/// it invoked, so the kind is stated explicitly instead of probing catalog
/// tables to guess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanRef {
    Basic,
    Combo { id: Uuid },
}

/// A quantity-priced component of a basic plan (seats, workspaces)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantityComponent {
    pub unit_price: Decimal,
    pub quantity: u32,
    pub amount: Decimal,
}

impl QuantityComponent {
    fn new(unit_price: Decimal, quantity: u32) -> Self {
        Self {
            unit_price,
            quantity,
            amount: unit_price * Decimal::from(quantity),
        }
    }
}

/// One module line in a breakdown
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleLine {
    pub module_id: Uuid,
    pub name: String,
    pub price: Decimal,
}

/// Full price breakdown for a quote
///
/// Computed fresh on every quote and never mutated. Persisted verbatim as
/// the subscription's pricing snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub plan: PlanRef,
    pub cycle: BillingCycle,
    pub currency: String,
    pub base_price: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<QuantityComponent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspaces: Option<QuantityComponent>,
    pub modules: Vec<ModuleLine>,
    pub subtotal: Decimal,
    pub coupon: CouponOutcome,
    pub total: Decimal,
}

/// Basic plan quote parameters
#[derive(Debug, Clone)]
pub struct BasicQuoteParams {
    pub users: u32,
    pub workspaces: u32,
    pub cycle: BillingCycle,
    pub module_ids: Vec<Uuid>,
    pub coupon_code: Option<String>,
}

/// Composes catalog lookups and coupon validation into price breakdowns
#[derive(Clone)]
pub struct PricingCalculator {
    catalog: Arc<dyn PlanCatalog>,
    coupons: Arc<dyn CouponStore>,
    currency: String,
}

impl PricingCalculator {
    pub fn new(catalog: Arc<dyn PlanCatalog>, coupons: Arc<dyn CouponStore>, currency: String) -> Self {
        Self {
            catalog,
            coupons,
            currency,
        }
    }

    /// Quote an a-la-carte basic plan:
    /// base + users * per_user + workspaces * per_workspace + selected modules.
    pub async fn quote_basic(&self, params: &BasicQuoteParams) -> BillingResult<PriceBreakdown> {
        let rates = self.catalog.basic_rates(params.cycle).await?;
        let modules = self.catalog.modules(&params.module_ids).await?;

        let users = QuantityComponent::new(rates.price_per_user, params.users);
        let workspaces = QuantityComponent::new(rates.price_per_workspace, params.workspaces);

        let module_lines: Vec<ModuleLine> = modules
            .iter()
            .map(|m| ModuleLine {
                module_id: m.id,
                name: m.name.clone(),
                price: m.price_for(params.cycle),
            })
            .collect();
        let modules_total: Decimal = module_lines.iter().map(|m| m.price).sum();

        let subtotal = rates.base_price + users.amount + workspaces.amount + modules_total;

        let coupon = self
            .validate_coupon(params.coupon_code.as_deref(), subtotal)
            .await?;

        Ok(PriceBreakdown {
            plan: PlanRef::Basic,
            cycle: params.cycle,
            currency: self.currency.clone(),
            base_price: rates.base_price,
            total: Self::total_after_discount(subtotal, &coupon),
            users: Some(users),
            workspaces: Some(workspaces),
            modules: module_lines,
            subtotal,
            coupon,
        })
    }

    /// Quote a combo plan: flat bundle price + its bundled modules.
    pub async fn quote_combo(
        &self,
        plan_id: Uuid,
        cycle: BillingCycle,
        coupon_code: Option<&str>,
    ) -> BillingResult<PriceBreakdown> {
        let plan = self.catalog.combo_plan(plan_id).await?;
        let modules = self.catalog.modules(&plan.bundled_module_ids).await?;

        let module_lines: Vec<ModuleLine> = modules
            .iter()
            .map(|m| ModuleLine {
                module_id: m.id,
                name: m.name.clone(),
                price: m.price_for(cycle),
            })
            .collect();
        let modules_total: Decimal = module_lines.iter().map(|m| m.price).sum();

        let subtotal = plan.price_for(cycle) + modules_total;

        let coupon = self.validate_coupon(coupon_code, subtotal).await?;

        Ok(PriceBreakdown {
            plan: PlanRef::Combo { id: plan.id },
            cycle,
            currency: self.currency.clone(),
            base_price: plan.price_for(cycle),
            users: None,
            workspaces: None,
            total: Self::total_after_discount(subtotal, &coupon),
            modules: module_lines,
            subtotal,
            coupon,
        })
    }

    /// Look up and validate the coupon. Validation failures are embedded in
    /// the returned outcome, never raised: the caller sees the full-price
    /// total alongside the rejection reason and decides what to do with it.
    async fn validate_coupon(
        &self,
        code: Option<&str>,
        subtotal: Decimal,
    ) -> BillingResult<CouponOutcome> {
        let lookup = match code {
            None => CouponLookup::NoCode,
            Some(code) => match self.coupons.find_by_code(code).await? {
                Some(coupon) => CouponLookup::Found(coupon),
                None => CouponLookup::NotFound(code.to_string()),
            },
        };
        Ok(coupon::validate(&lookup, subtotal, OffsetDateTime::now_utc()))
    }

    /// A discount can equal the subtotal but never exceed it: the total is
    /// floored at zero.
    fn total_after_discount(subtotal: Decimal, coupon: &CouponOutcome) -> Decimal {
        if coupon.applied {
            (subtotal - coupon.discount_amount).max(Decimal::ZERO)
        } else {
            subtotal
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryCatalog, InMemoryCouponStore};
    use crate::coupon::{Coupon, DiscountType};
    use rust_decimal_macros::dec;

    fn calculator(catalog: InMemoryCatalog, coupons: InMemoryCouponStore) -> PricingCalculator {
        PricingCalculator::new(Arc::new(catalog), Arc::new(coupons), "usd".to_string())
    }

    #[tokio::test]
    async fn basic_quote_sums_all_components_exactly() {
        let catalog = InMemoryCatalog::with_basic_rates(dec!(100), dec!(10), dec!(5));
        let crm = catalog.add_module("CRM", dec!(30), dec!(300));
        let helpdesk = catalog.add_module("Helpdesk", dec!(20), dec!(200));
        let calc = calculator(catalog, InMemoryCouponStore::default());

        let quote = calc
            .quote_basic(&BasicQuoteParams {
                users: 4,
                workspaces: 2,
                cycle: BillingCycle::Monthly,
                module_ids: vec![crm, helpdesk],
                coupon_code: None,
            })
            .await
            .unwrap();

        // 100 + 4*10 + 2*5 + 30 + 20
        assert_eq!(quote.subtotal, dec!(200));
        assert_eq!(quote.total, dec!(200));
        assert!(!quote.coupon.applied);
        assert!(quote.coupon.error.is_none());
        assert_eq!(quote.users.as_ref().unwrap().amount, dec!(40));
        assert_eq!(quote.workspaces.as_ref().unwrap().amount, dec!(10));
        assert_eq!(quote.modules.len(), 2);
    }

    #[tokio::test]
    async fn yearly_prices_are_independent_not_a_multiplier() {
        let catalog = InMemoryCatalog::with_basic_rates(dec!(100), dec!(10), dec!(5))
            .with_yearly_rates(dec!(1000), dec!(96), dec!(48));
        let calc = calculator(catalog, InMemoryCouponStore::default());

        let quote = calc
            .quote_basic(&BasicQuoteParams {
                users: 1,
                workspaces: 1,
                cycle: BillingCycle::Yearly,
                module_ids: vec![],
                coupon_code: None,
            })
            .await
            .unwrap();

        assert_eq!(quote.subtotal, dec!(1144));
    }

    #[tokio::test]
    async fn combo_quote_adds_bundled_modules() {
        let catalog = InMemoryCatalog::default();
        let a = catalog.add_module("Accounting", dec!(50), dec!(500));
        let b = catalog.add_module("CRM", dec!(75), dec!(750));
        let combo = catalog.add_combo("Suite", dec!(500), dec!(5000), vec![a, b]);
        let calc = calculator(catalog, InMemoryCouponStore::default());

        let quote = calc
            .quote_combo(combo, BillingCycle::Monthly, None)
            .await
            .unwrap();

        assert_eq!(quote.subtotal, dec!(625));
        assert_eq!(quote.total, dec!(625));
        assert_eq!(quote.base_price, dec!(500));
    }

    #[tokio::test]
    async fn fixed_discount_equal_to_subtotal_floors_total_at_zero() {
        let catalog = InMemoryCatalog::default();
        let a = catalog.add_module("Accounting", dec!(50), dec!(500));
        let b = catalog.add_module("CRM", dec!(75), dec!(750));
        let combo = catalog.add_combo("Suite", dec!(500), dec!(5000), vec![a, b]);

        let coupons = InMemoryCouponStore::default();
        coupons.insert(Coupon {
            code: "FULLCOMP".to_string(),
            discount: dec!(625),
            discount_type: DiscountType::Fixed,
            is_active: true,
            expires_at: None,
            usage_limit: None,
            used_count: 0,
            minimum_spend: None,
            maximum_spend: None,
        });
        let calc = calculator(catalog, coupons);

        let quote = calc
            .quote_combo(combo, BillingCycle::Monthly, Some("FULLCOMP"))
            .await
            .unwrap();

        assert!(quote.coupon.applied);
        assert_eq!(quote.coupon.discount_amount, dec!(625));
        assert_eq!(quote.total, dec!(0));
    }

    #[tokio::test]
    async fn coupon_error_is_reported_and_total_stays_full_price() {
        let catalog = InMemoryCatalog::with_basic_rates(dec!(100), dec!(10), dec!(5));
        let calc = calculator(catalog, InMemoryCouponStore::default());

        let quote = calc
            .quote_basic(&BasicQuoteParams {
                users: 0,
                workspaces: 0,
                cycle: BillingCycle::Monthly,
                module_ids: vec![],
                coupon_code: Some("DOESNOTEXIST".to_string()),
            })
            .await
            .unwrap();

        assert!(!quote.coupon.applied);
        assert_eq!(quote.coupon.error.as_deref(), Some("Invalid coupon code"));
        assert_eq!(quote.total, quote.subtotal);
    }

    #[tokio::test]
    async fn unknown_module_fails_the_quote() {
        let catalog = InMemoryCatalog::with_basic_rates(dec!(100), dec!(10), dec!(5));
        let calc = calculator(catalog, InMemoryCouponStore::default());

        let err = calc
            .quote_basic(&BasicQuoteParams {
                users: 1,
                workspaces: 1,
                cycle: BillingCycle::Monthly,
                module_ids: vec![Uuid::new_v4()],
                coupon_code: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, crate::error::BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn percentage_coupon_applies_against_computed_subtotal() {
        let catalog = InMemoryCatalog::with_basic_rates(dec!(800), dec!(100), dec!(0));
        let coupons = InMemoryCouponStore::default();
        coupons.insert(Coupon {
            code: "SPRING20".to_string(),
            discount: dec!(20),
            discount_type: DiscountType::Percentage,
            is_active: true,
            expires_at: None,
            usage_limit: None,
            used_count: 0,
            minimum_spend: None,
            maximum_spend: None,
        });
        let calc = calculator(catalog, coupons);

        let quote = calc
            .quote_basic(&BasicQuoteParams {
                users: 2,
                workspaces: 0,
                cycle: BillingCycle::Monthly,
                module_ids: vec![],
                coupon_code: Some("SPRING20".to_string()),
            })
            .await
            .unwrap();

        assert_eq!(quote.subtotal, dec!(1000));
        assert_eq!(quote.coupon.discount_amount, dec!(200));
        assert_eq!(quote.total, dec!(800));
    }
}
