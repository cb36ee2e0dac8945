//! In-memory test doubles for the billing core
//!
//! Real trait implementations backed by memory, plus a recording gateway
//! whose call log lets tests assert exactly which provider calls happened.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sha2::Sha256;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use opsuite_shared::{BillingCycle, SubscriptionStatus, TenantId};

use crate::catalog::{BasicPlanRates, ComboPlan, ModulePrice, PlanCatalog};
use crate::coupon::{Coupon, CouponOutcome, CouponStore};
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventSink, BillingEventType};
use crate::gateway::{PaymentGateway, ProviderSubscription, UpcomingInvoice};
use crate::pricing::{PlanRef, PriceBreakdown, PricingCalculator};
use crate::store::{BillingProfile, SubscriptionRecord, SubscriptionStore};
use crate::subscriptions::SubscriptionService;

// =============================================================================
// Catalog
// =============================================================================

#[derive(Default)]
struct CatalogState {
    monthly: Option<BasicPlanRates>,
    yearly: Option<BasicPlanRates>,
    modules: HashMap<Uuid, ModulePrice>,
    combos: HashMap<Uuid, ComboPlan>,
}

#[derive(Default)]
pub struct InMemoryCatalog {
    state: Mutex<CatalogState>,
}

impl InMemoryCatalog {
    pub fn with_basic_rates(base: Decimal, per_user: Decimal, per_workspace: Decimal) -> Self {
        let catalog = Self::default();
        catalog.state.lock().unwrap().monthly = Some(BasicPlanRates {
            base_price: base,
            price_per_user: per_user,
            price_per_workspace: per_workspace,
        });
        catalog
    }

    pub fn with_yearly_rates(self, base: Decimal, per_user: Decimal, per_workspace: Decimal) -> Self {
        self.state.lock().unwrap().yearly = Some(BasicPlanRates {
            base_price: base,
            price_per_user: per_user,
            price_per_workspace: per_workspace,
        });
        self
    }

    pub fn add_module(&self, name: &str, monthly: Decimal, yearly: Decimal) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().unwrap().modules.insert(
            id,
            ModulePrice {
                id,
                name: name.to_string(),
                monthly_price: monthly,
                yearly_price: yearly,
            },
        );
        id
    }

    pub fn add_combo(
        &self,
        name: &str,
        monthly: Decimal,
        yearly: Decimal,
        bundled_module_ids: Vec<Uuid>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.state.lock().unwrap().combos.insert(
            id,
            ComboPlan {
                id,
                name: name.to_string(),
                monthly_price: monthly,
                yearly_price: yearly,
                bundled_module_ids,
                user_limit: 50,
                workspace_limit: 10,
            },
        );
        id
    }
}

#[async_trait]
impl PlanCatalog for InMemoryCatalog {
    async fn basic_rates(&self, cycle: BillingCycle) -> BillingResult<BasicPlanRates> {
        let state = self.state.lock().unwrap();
        let rates = match cycle {
            BillingCycle::Monthly => state.monthly.clone(),
            BillingCycle::Yearly => state.yearly.clone().or_else(|| state.monthly.clone()),
        };
        rates.ok_or_else(|| BillingError::NotFound("no basic plan rates".to_string()))
    }

    async fn modules(&self, ids: &[Uuid]) -> BillingResult<Vec<ModulePrice>> {
        let state = self.state.lock().unwrap();
        ids.iter()
            .map(|id| {
                state
                    .modules
                    .get(id)
                    .cloned()
                    .ok_or_else(|| BillingError::NotFound(format!("unknown module: {}", id)))
            })
            .collect()
    }

    async fn combo_plan(&self, id: Uuid) -> BillingResult<ComboPlan> {
        self.state
            .lock()
            .unwrap()
            .combos
            .get(&id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("combo plan not found: {}", id)))
    }
}

// =============================================================================
// Coupons
// =============================================================================

#[derive(Default)]
pub struct InMemoryCouponStore {
    coupons: Mutex<HashMap<String, Coupon>>,
}

impl InMemoryCouponStore {
    pub fn insert(&self, coupon: Coupon) {
        self.coupons
            .lock()
            .unwrap()
            .insert(coupon.code.clone(), coupon);
    }

    pub fn used_count(&self, code: &str) -> i32 {
        self.coupons
            .lock()
            .unwrap()
            .get(code)
            .map(|c| c.used_count)
            .unwrap_or(0)
    }
}

#[async_trait]
impl CouponStore for InMemoryCouponStore {
    async fn find_by_code(&self, code: &str) -> BillingResult<Option<Coupon>> {
        Ok(self.coupons.lock().unwrap().get(code).cloned())
    }

    async fn record_use(&self, code: &str) -> BillingResult<()> {
        if let Some(coupon) = self.coupons.lock().unwrap().get_mut(code) {
            let at_limit = coupon
                .usage_limit
                .is_some_and(|limit| coupon.used_count >= limit);
            if !at_limit {
                coupon.used_count += 1;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Subscription store
// =============================================================================

#[derive(Default)]
struct StoreState {
    records: HashMap<Uuid, SubscriptionRecord>,
    profiles: HashMap<Uuid, BillingProfile>,
    plan_resets: Vec<TenantId>,
}

#[derive(Default)]
pub struct InMemorySubscriptionStore {
    state: Mutex<StoreState>,
}

impl InMemorySubscriptionStore {
    pub fn plan_resets(&self) -> Vec<TenantId> {
        self.state.lock().unwrap().plan_resets.clone()
    }

    pub fn seed(&self, record: SubscriptionRecord) {
        self.state
            .lock()
            .unwrap()
            .records
            .insert(record.id, record);
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn insert(&self, record: &SubscriptionRecord) -> BillingResult<()> {
        let mut state = self.state.lock().unwrap();
        let open_exists = state
            .records
            .values()
            .any(|r| r.tenant_id == record.tenant_id && r.status.is_open());
        if open_exists {
            return Err(BillingError::Conflict("resource already exists".to_string()));
        }
        state.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn find_open_by_tenant(
        &self,
        tenant_id: TenantId,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .records
            .values()
            .find(|r| r.tenant_id == tenant_id && r.status.is_open())
            .cloned())
    }

    async fn find_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .records
            .values()
            .find(|r| r.provider_subscription_id == provider_subscription_id)
            .cloned())
    }

    async fn update(&self, record: &SubscriptionRecord) -> BillingResult<()> {
        self.state
            .lock()
            .unwrap()
            .records
            .insert(record.id, record.clone());
        Ok(())
    }

    async fn billing_profile(&self, tenant_id: TenantId) -> BillingResult<Option<BillingProfile>> {
        Ok(self.state.lock().unwrap().profiles.get(&tenant_id.0).cloned())
    }

    async fn save_billing_profile(
        &self,
        tenant_id: TenantId,
        profile: &BillingProfile,
    ) -> BillingResult<()> {
        self.state
            .lock()
            .unwrap()
            .profiles
            .insert(tenant_id.0, profile.clone());
        Ok(())
    }

    async fn reset_tenant_plan(&self, tenant_id: TenantId) -> BillingResult<()> {
        self.state.lock().unwrap().plan_resets.push(tenant_id);
        Ok(())
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// Recording payment gateway. Every call appends a line to the call log;
/// failures can be scripted per operation as a FIFO of errors.
#[derive(Default)]
pub struct MockGateway {
    calls: Mutex<Vec<String>>,
    attach_failures: Mutex<VecDeque<BillingError>>,
    detach_failures: Mutex<VecDeque<BillingError>>,
    create_failures: Mutex<VecDeque<BillingError>>,
    /// Provider status returned from create_subscription (default "active")
    create_status: Mutex<String>,
    counter: AtomicU64,
}

impl MockGateway {
    pub fn new() -> Self {
        let gateway = Self::default();
        *gateway.create_status.lock().unwrap() = "active".to_string();
        gateway
    }

    pub fn fail_attach(&self, err: BillingError) {
        self.attach_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_detach(&self, err: BillingError) {
        self.detach_failures.lock().unwrap().push_back(err);
    }

    pub fn fail_create(&self, err: BillingError) {
        self.create_failures.lock().unwrap().push_back(err);
    }

    pub fn set_create_status(&self, status: &str) {
        *self.create_status.lock().unwrap() = status.to_string();
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst))
    }

    fn periods() -> (OffsetDateTime, OffsetDateTime) {
        let start = OffsetDateTime::now_utc();
        (start, start + Duration::days(30))
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    async fn create_customer(&self, email: &str, _name: &str) -> BillingResult<String> {
        self.record(format!("create_customer:{}", email));
        Ok(self.next_id("cus"))
    }

    async fn attach_payment_method(&self, method_id: &str, customer_id: &str) -> BillingResult<()> {
        self.record(format!("attach:{}:{}", method_id, customer_id));
        if let Some(err) = self.attach_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(())
    }

    async fn detach_payment_method(&self, method_id: &str) -> BillingResult<()> {
        self.record(format!("detach:{}", method_id));
        if let Some(err) = self.detach_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(())
    }

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        method_id: &str,
    ) -> BillingResult<()> {
        self.record(format!("set_default:{}:{}", customer_id, method_id));
        Ok(())
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        amount_minor_units: i64,
        _cycle: BillingCycle,
    ) -> BillingResult<ProviderSubscription> {
        self.record(format!(
            "create_subscription:{}:amount={}",
            customer_id, amount_minor_units
        ));
        if let Some(err) = self.create_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let (start, end) = Self::periods();
        Ok(ProviderSubscription {
            id: self.next_id("sub"),
            status: self.create_status.lock().unwrap().clone(),
            current_period_start: start,
            current_period_end: end,
            cancel_at_period_end: false,
            latest_invoice_client_secret: Some("pi_secret_test".to_string()),
        })
    }

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        amount_minor_units: i64,
        _cycle: BillingCycle,
    ) -> BillingResult<ProviderSubscription> {
        self.record(format!(
            "update_price:{}:amount={}",
            subscription_id, amount_minor_units
        ));
        let (start, end) = Self::periods();
        Ok(ProviderSubscription {
            id: subscription_id.to_string(),
            status: "active".to_string(),
            current_period_start: start,
            current_period_end: end,
            cancel_at_period_end: false,
            latest_invoice_client_secret: None,
        })
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> BillingResult<ProviderSubscription> {
        self.record(format!(
            "cancel:{}:at_period_end={}",
            subscription_id, at_period_end
        ));
        let (start, end) = Self::periods();
        Ok(ProviderSubscription {
            id: subscription_id.to_string(),
            status: if at_period_end { "active" } else { "canceled" }.to_string(),
            current_period_start: start,
            current_period_end: end,
            cancel_at_period_end: at_period_end,
            latest_invoice_client_secret: None,
        })
    }

    async fn preview_upcoming_invoice(
        &self,
        subscription_id: &str,
    ) -> BillingResult<UpcomingInvoice> {
        self.record(format!("preview:{}", subscription_id));
        Ok(UpcomingInvoice {
            amount_due_minor_units: 0,
            currency: "usd".to_string(),
            period_end: None,
        })
    }
}

// =============================================================================
// Events
// =============================================================================

#[derive(Default)]
pub struct CapturingEventSink {
    events: Mutex<Vec<(TenantId, BillingEventType)>>,
}

impl CapturingEventSink {
    pub fn recorded(&self) -> Vec<(TenantId, BillingEventType)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl BillingEventSink for CapturingEventSink {
    async fn record(
        &self,
        tenant_id: TenantId,
        event_type: BillingEventType,
        _provider_subscription_id: Option<&str>,
        _data: serde_json::Value,
    ) {
        self.events.lock().unwrap().push((tenant_id, event_type));
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct TestHarness {
    pub catalog: Arc<InMemoryCatalog>,
    pub coupons: Arc<InMemoryCouponStore>,
    pub store: Arc<InMemorySubscriptionStore>,
    pub gateway: Arc<MockGateway>,
    pub events: Arc<CapturingEventSink>,
}

impl TestHarness {
    pub async fn record(&self, provider_subscription_id: &str) -> SubscriptionRecord {
        self.store
            .find_by_provider_id(provider_subscription_id)
            .await
            .unwrap()
            .expect("subscription should exist")
    }
}

/// A fully wired lifecycle service over in-memory doubles. Basic rates are
/// 100 base / 10 per seat / 5 per workspace monthly.
pub async fn test_service() -> (Arc<SubscriptionService>, TestHarness) {
    let catalog = Arc::new(InMemoryCatalog::with_basic_rates(
        dec!(100),
        dec!(10),
        dec!(5),
    ));
    let coupons = Arc::new(InMemoryCouponStore::default());
    let store = Arc::new(InMemorySubscriptionStore::default());
    let gateway = Arc::new(MockGateway::new());
    let events = Arc::new(CapturingEventSink::default());

    let pricing = PricingCalculator::new(
        catalog.clone() as Arc<dyn PlanCatalog>,
        coupons.clone() as Arc<dyn CouponStore>,
        "usd".to_string(),
    );

    let service = Arc::new(SubscriptionService::new(
        pricing,
        gateway.clone() as Arc<dyn PaymentGateway>,
        store.clone() as Arc<dyn SubscriptionStore>,
        coupons.clone() as Arc<dyn CouponStore>,
        events.clone() as Arc<dyn BillingEventSink>,
    ));

    (
        service,
        TestHarness {
            catalog,
            coupons,
            store,
            gateway,
            events,
        },
    )
}

/// A seeded active subscription for webhook/reconfigure scenarios
pub struct SeededSubscription {
    pub tenant_id: TenantId,
    pub provider_subscription_id: String,
}

impl SeededSubscription {
    pub async fn active(harness: &TestHarness) -> Self {
        Self::with_status(harness, SubscriptionStatus::Active, false).await
    }

    pub async fn with_status(
        harness: &TestHarness,
        status: SubscriptionStatus,
        cancel_at_period_end: bool,
    ) -> Self {
        let tenant_id = TenantId::new();
        let provider_subscription_id = format!("sub_seed_{}", Uuid::new_v4().simple());
        let now = OffsetDateTime::now_utc();

        harness.store.seed(SubscriptionRecord {
            id: Uuid::new_v4(),
            tenant_id,
            plan: PlanRef::Basic,
            seats: 3,
            workspaces: 1,
            module_ids: vec![],
            cycle: BillingCycle::Monthly,
            coupon_code: None,
            provider_customer_id: format!("cus_seed_{}", Uuid::new_v4().simple()),
            provider_subscription_id: provider_subscription_id.clone(),
            status,
            cancel_at_period_end,
            current_period_start: Some(now),
            current_period_end: Some(now + Duration::days(30)),
            next_billing_at: Some(now + Duration::days(30)),
            breakdown: empty_breakdown(),
            created_at: now,
            updated_at: now,
        });

        Self {
            tenant_id,
            provider_subscription_id,
        }
    }
}

/// A minimal breakdown snapshot for seeded records
pub fn empty_breakdown() -> PriceBreakdown {
    PriceBreakdown {
        plan: PlanRef::Basic,
        cycle: BillingCycle::Monthly,
        currency: "usd".to_string(),
        base_price: dec!(100),
        users: None,
        workspaces: None,
        modules: vec![],
        subtotal: dec!(100),
        coupon: CouponOutcome {
            applied: false,
            code: None,
            discount_amount: Decimal::ZERO,
            message: None,
            error: None,
        },
        total: dec!(100),
    }
}

// =============================================================================
// Webhook signing
// =============================================================================

/// Sign a payload the way the provider does: HMAC-SHA256 over
/// `"{t}.{payload}"`, header `t=<ts>,v1=<hex>`
pub fn sign_payload(secret: &str, payload: &str) -> String {
    sign_payload_at(secret, payload, OffsetDateTime::now_utc().unix_timestamp())
}

pub fn sign_payload_at(secret: &str, payload: &str, timestamp: i64) -> String {
    let key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key.as_bytes()).expect("hmac accepts any key length");
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());
    format!("t={},v1={}", timestamp, signature)
}
