//! Coupon validation engine
//!
//! Validation is a pure function over a coupon record, a computed subtotal,
//! and the current time. Checks run in a fixed order and the first failing
//! check wins: there is no partial application. A failed validation is NOT a
//! billing error; it is reported inside the price breakdown and the caller
//! decides whether to reject or proceed at full price.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::BillingResult;

/// How a coupon's discount value is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    /// `discount` is a percentage of the subtotal
    Percentage,
    /// `discount` is an absolute amount
    Fixed,
}

impl DiscountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscountType::Percentage => "percentage",
            DiscountType::Fixed => "fixed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "percentage" => Some(DiscountType::Percentage),
            "fixed" => Some(DiscountType::Fixed),
            _ => None,
        }
    }
}

/// A discount rule applied against a computed subtotal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coupon {
    pub code: String,
    pub discount: Decimal,
    pub discount_type: DiscountType,
    pub is_active: bool,
    pub expires_at: Option<OffsetDateTime>,
    pub usage_limit: Option<i32>,
    pub used_count: i32,
    pub minimum_spend: Option<Decimal>,
    /// Cap on the computed discount amount. A 20% coupon on a large subtotal
    /// can otherwise exceed what the campaign intended to give away.
    pub maximum_spend: Option<Decimal>,
}

/// Result of looking up a coupon code before validation
#[derive(Debug, Clone)]
pub enum CouponLookup {
    /// No code supplied with the request
    NoCode,
    /// A code was supplied but no such coupon exists
    NotFound(String),
    /// The coupon record to validate
    Found(Coupon),
}

/// Outcome of validating a coupon against a subtotal
///
/// `error` set means the coupon did not apply and the final total equals the
/// subtotal. The outcome is embedded verbatim in the price breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouponOutcome {
    pub applied: bool,
    pub code: Option<String>,
    pub discount_amount: Decimal,
    pub message: Option<String>,
    pub error: Option<String>,
}

impl CouponOutcome {
    fn none() -> Self {
        Self {
            applied: false,
            code: None,
            discount_amount: Decimal::ZERO,
            message: None,
            error: None,
        }
    }

    fn rejected(code: &str, error: &str, message: Option<String>) -> Self {
        Self {
            applied: false,
            code: Some(code.to_string()),
            discount_amount: Decimal::ZERO,
            message,
            error: Some(error.to_string()),
        }
    }
}

/// Validate a coupon against a subtotal at a point in time.
///
/// Check order (first failure wins):
/// 1. no code supplied -> not applied, no error
/// 2. code not found -> "Invalid coupon code"
/// 3. inactive
/// 4. expired
/// 5. usage limit reached
/// 6. minimum spend not met (boundary inclusive: subtotal == minimum passes)
/// 7. compute discount; clamp to `maximum_spend` when set
pub fn validate(lookup: &CouponLookup, subtotal: Decimal, now: OffsetDateTime) -> CouponOutcome {
    let coupon = match lookup {
        CouponLookup::NoCode => return CouponOutcome::none(),
        CouponLookup::NotFound(code) => {
            return CouponOutcome::rejected(code, "Invalid coupon code", None);
        }
        CouponLookup::Found(coupon) => coupon,
    };

    if !coupon.is_active {
        return CouponOutcome::rejected(
            &coupon.code,
            "inactive",
            Some(format!("Coupon {} is no longer active", coupon.code)),
        );
    }

    if let Some(expires_at) = coupon.expires_at {
        if now > expires_at {
            return CouponOutcome::rejected(
                &coupon.code,
                "expired",
                Some(format!("Coupon {} expired on {}", coupon.code, expires_at)),
            );
        }
    }

    if let Some(limit) = coupon.usage_limit {
        if coupon.used_count >= limit {
            return CouponOutcome::rejected(
                &coupon.code,
                "usage limit reached",
                Some(format!("Coupon {} has been fully redeemed", coupon.code)),
            );
        }
    }

    if let Some(minimum) = coupon.minimum_spend {
        if subtotal < minimum {
            return CouponOutcome::rejected(
                &coupon.code,
                "minimum spend not met",
                Some(format!("Requires a minimum spend of {}", minimum)),
            );
        }
    }

    let raw_discount = match coupon.discount_type {
        DiscountType::Percentage => subtotal * coupon.discount / Decimal::from(100),
        DiscountType::Fixed => coupon.discount,
    };

    let (discount_amount, message) = match coupon.maximum_spend {
        Some(cap) if raw_discount > cap => (
            cap,
            Some(format!("Discount capped at {}", cap)),
        ),
        _ => (raw_discount, None),
    };

    CouponOutcome {
        applied: true,
        code: Some(coupon.code.clone()),
        discount_amount,
        message,
        error: None,
    }
}

/// Coupon persistence consumed by the pricing calculator and lifecycle manager
#[async_trait]
pub trait CouponStore: Send + Sync {
    async fn find_by_code(&self, code: &str) -> BillingResult<Option<Coupon>>;

    /// Increment the redemption counter. Guarded by the usage limit in SQL so
    /// two concurrent redemptions cannot both take the last slot.
    async fn record_use(&self, code: &str) -> BillingResult<()>;
}

/// Postgres-backed coupon store
pub struct PgCouponStore {
    pool: PgPool,
}

impl PgCouponStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct CouponRow {
    code: String,
    discount: Decimal,
    discount_type: String,
    is_active: bool,
    expires_at: Option<OffsetDateTime>,
    usage_limit: Option<i32>,
    used_count: i32,
    minimum_spend: Option<Decimal>,
    maximum_spend: Option<Decimal>,
}

#[async_trait]
impl CouponStore for PgCouponStore {
    async fn find_by_code(&self, code: &str) -> BillingResult<Option<Coupon>> {
        let row: Option<CouponRow> = sqlx::query_as(
            r#"
            SELECT code, discount, discount_type, is_active, expires_at,
                   usage_limit, used_count, minimum_spend, maximum_spend
            FROM coupons
            WHERE code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| Coupon {
            // An unknown type string disables the coupon rather than applying
            // an unintended discount
            discount_type: DiscountType::parse(&r.discount_type).unwrap_or(DiscountType::Fixed),
            is_active: r.is_active && DiscountType::parse(&r.discount_type).is_some(),
            code: r.code,
            discount: r.discount,
            expires_at: r.expires_at,
            usage_limit: r.usage_limit,
            used_count: r.used_count,
            minimum_spend: r.minimum_spend,
            maximum_spend: r.maximum_spend,
        }))
    }

    async fn record_use(&self, code: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE coupons
            SET used_count = used_count + 1, updated_at = NOW()
            WHERE code = $1
              AND (usage_limit IS NULL OR used_count < usage_limit)
            "#,
        )
        .bind(code)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
