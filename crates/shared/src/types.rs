//! Common types used across Opsuite

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Tenant ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TenantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Billing
// =============================================================================

/// Billing cycle for subscriptions and catalog prices
///
/// Monthly and yearly prices are configured independently on every catalog
/// row; there is no 12x conversion between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Yearly => "yearly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "monthly" => Some(BillingCycle::Monthly),
            "yearly" | "annual" => Some(BillingCycle::Yearly),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subscription lifecycle status
///
/// Local state machine: `none -> incomplete -> active <-> past_due -> canceled`.
/// `active -> canceled` is also reachable directly (immediate cancel) or via
/// the `cancel_at_period_end` flag once the provider confirms period end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Incomplete,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// Parse a status string as reported by the payment provider.
    ///
    /// Trialing subscriptions are entitled, so they count as active; unpaid is
    /// the provider's terminal dunning state and maps to past_due. Statuses we
    /// don't model return None and the caller decides whether to skip.
    pub fn from_provider(s: &str) -> Option<Self> {
        match s {
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            "active" | "trialing" => Some(SubscriptionStatus::Active),
            "past_due" | "unpaid" => Some(SubscriptionStatus::PastDue),
            "canceled" | "incomplete_expired" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }

    /// Whether this status blocks creation of another subscription for the
    /// same tenant. At most one open subscription may exist per tenant.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Incomplete | SubscriptionStatus::Active | SubscriptionStatus::PastDue
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_cycle_roundtrip() {
        assert_eq!(BillingCycle::parse("monthly"), Some(BillingCycle::Monthly));
        assert_eq!(BillingCycle::parse("yearly"), Some(BillingCycle::Yearly));
        assert_eq!(BillingCycle::parse("annual"), Some(BillingCycle::Yearly));
        assert_eq!(BillingCycle::parse("weekly"), None);
        assert_eq!(BillingCycle::Monthly.as_str(), "monthly");
    }

    #[test]
    fn test_status_from_provider() {
        assert_eq!(
            SubscriptionStatus::from_provider("trialing"),
            Some(SubscriptionStatus::Active)
        );
        assert_eq!(
            SubscriptionStatus::from_provider("unpaid"),
            Some(SubscriptionStatus::PastDue)
        );
        assert_eq!(SubscriptionStatus::from_provider("paused"), None);
    }

    #[test]
    fn test_open_statuses() {
        assert!(SubscriptionStatus::Incomplete.is_open());
        assert!(SubscriptionStatus::Active.is_open());
        assert!(SubscriptionStatus::PastDue.is_open());
        assert!(!SubscriptionStatus::Canceled.is_open());
    }
}
