//! Payment provider gateway
//!
//! The lifecycle manager talks to the provider through the `PaymentGateway`
//! trait; `StripeGateway` is the production adapter over async-stripe. This
//! is the only layer that deals in minor units: quotes arrive as decimal
//! currency amounts and are converted exactly once, here.

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;
use time::OffsetDateTime;

use opsuite_shared::BillingCycle;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Provider-side view of a subscription, as returned by mutating calls.
/// Status is the provider's raw status string; the lifecycle manager owns
/// the mapping onto the local state machine.
#[derive(Debug, Clone)]
pub struct ProviderSubscription {
    pub id: String,
    pub status: String,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    /// Client secret of the first invoice's payment intent, when the
    /// provider requires on-session confirmation to activate.
    pub latest_invoice_client_secret: Option<String>,
}

/// Amounts on the provider's next invoice for a subscription
#[derive(Debug, Clone)]
pub struct UpcomingInvoice {
    pub amount_due_minor_units: i64,
    pub currency: String,
    pub period_end: Option<OffsetDateTime>,
}

/// Remote payment provider operations consumed by the lifecycle manager.
///
/// Mutating calls are never retried automatically by implementations; the
/// single permitted retry (re-attach after detach) is orchestrated by the
/// caller so it stays observable and testable.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_customer(&self, email: &str, name: &str) -> BillingResult<String>;

    /// Attach a payment method to a customer. Fails with
    /// `PaymentMethodAlreadyAttached` when the method is held by another
    /// customer, `PaymentMethodNotAttached` when the provider reports it
    /// detached mid-flight.
    async fn attach_payment_method(&self, method_id: &str, customer_id: &str) -> BillingResult<()>;

    async fn detach_payment_method(&self, method_id: &str) -> BillingResult<()>;

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        method_id: &str,
    ) -> BillingResult<()>;

    async fn create_subscription(
        &self,
        customer_id: &str,
        amount_minor_units: i64,
        cycle: BillingCycle,
    ) -> BillingResult<ProviderSubscription>;

    /// Replace the subscription's price with a new amount, prorating the
    /// difference for the remainder of the period.
    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        amount_minor_units: i64,
        cycle: BillingCycle,
    ) -> BillingResult<ProviderSubscription>;

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> BillingResult<ProviderSubscription>;

    async fn preview_upcoming_invoice(&self, subscription_id: &str)
        -> BillingResult<UpcomingInvoice>;
}

/// Convert a decimal currency amount to provider minor units (cents),
/// rounding half-up. This is the single conversion point in the system;
/// pricing arithmetic upstream stays in decimal units so rounding error
/// cannot compound across additive terms.
pub fn to_minor_units(amount: Decimal) -> BillingResult<i64> {
    // Half-up, not the default banker's rounding: customers expect 10.005
    // to charge as 10.01
    (amount * Decimal::from(100))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| BillingError::Internal(format!("amount out of range: {}", amount)))
}

/// Stripe implementation of the payment gateway
pub struct StripeGateway {
    stripe: StripeClient,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }

    fn currency(&self) -> BillingResult<stripe::Currency> {
        self.stripe
            .config()
            .currency
            .parse::<stripe::Currency>()
            .map_err(|_| {
                BillingError::Config(format!(
                    "unsupported currency: {}",
                    self.stripe.config().currency
                ))
            })
    }

    fn price_data(
        &self,
        amount_minor_units: i64,
        cycle: BillingCycle,
    ) -> BillingResult<stripe::SubscriptionPriceData> {
        use stripe::SubscriptionInterval as Interval;

        Ok(stripe::SubscriptionPriceData {
            currency: self.currency()?,
            product: self.stripe.config().product_id.clone(),
            recurring: stripe::SubscriptionPriceDataRecurring {
                interval: match cycle {
                    BillingCycle::Monthly => Interval::Month,
                    BillingCycle::Yearly => Interval::Year,
                },
                interval_count: None,
            },
            tax_behavior: None,
            unit_amount: Some(amount_minor_units),
            unit_amount_decimal: None,
        })
    }

    /// async-stripe surfaces attach/detach conflicts only through the error
    /// message, so discrimination is by message inspection.
    fn map_attach_error(err: stripe::StripeError) -> BillingError {
        let msg = err.to_string();
        if msg.contains("already been attached") || msg.contains("already attached") {
            BillingError::PaymentMethodAlreadyAttached
        } else if msg.contains("is not attached") || msg.contains("not attached to a customer") {
            BillingError::PaymentMethodNotAttached
        } else {
            BillingError::Provider(msg)
        }
    }
}

fn provider_subscription(sub: stripe::Subscription) -> BillingResult<ProviderSubscription> {
    let current_period_start = OffsetDateTime::from_unix_timestamp(sub.current_period_start)
        .map_err(|e| BillingError::Provider(format!("bad period start: {}", e)))?;
    let current_period_end = OffsetDateTime::from_unix_timestamp(sub.current_period_end)
        .map_err(|e| BillingError::Provider(format!("bad period end: {}", e)))?;

    let latest_invoice_client_secret = match sub.latest_invoice {
        Some(stripe::Expandable::Object(invoice)) => match invoice.payment_intent {
            Some(stripe::Expandable::Object(intent)) => intent.client_secret,
            _ => None,
        },
        _ => None,
    };

    Ok(ProviderSubscription {
        id: sub.id.to_string(),
        status: sub.status.to_string(),
        current_period_start,
        current_period_end,
        cancel_at_period_end: sub.cancel_at_period_end,
        latest_invoice_client_secret,
    })
}

fn parse_customer_id(customer_id: &str) -> BillingResult<stripe::CustomerId> {
    customer_id
        .parse::<stripe::CustomerId>()
        .map_err(|e| BillingError::Provider(format!("Invalid customer ID: {}", e)))
}

fn parse_subscription_id(subscription_id: &str) -> BillingResult<stripe::SubscriptionId> {
    subscription_id
        .parse::<stripe::SubscriptionId>()
        .map_err(|e| BillingError::Provider(format!("Invalid subscription ID: {}", e)))
}

fn parse_payment_method_id(method_id: &str) -> BillingResult<stripe::PaymentMethodId> {
    method_id
        .parse::<stripe::PaymentMethodId>()
        .map_err(|e| BillingError::Provider(format!("Invalid payment method ID: {}", e)))
}

#[derive(Serialize)]
struct UpcomingInvoiceQuery<'a> {
    subscription: &'a str,
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_customer(&self, email: &str, name: &str) -> BillingResult<String> {
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("platform".to_string(), "opsuite".to_string());

        let params = stripe::CreateCustomer {
            email: Some(email),
            name: Some(name),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = stripe::Customer::create(self.stripe.inner(), params).await?;

        tracing::info!(customer_id = %customer.id, "Created provider customer");

        Ok(customer.id.to_string())
    }

    async fn attach_payment_method(&self, method_id: &str, customer_id: &str) -> BillingResult<()> {
        let pm_id = parse_payment_method_id(method_id)?;
        let customer_id = parse_customer_id(customer_id)?;

        stripe::PaymentMethod::attach(
            self.stripe.inner(),
            &pm_id,
            stripe::AttachPaymentMethod {
                customer: customer_id,
            },
        )
        .await
        .map_err(Self::map_attach_error)?;

        Ok(())
    }

    async fn detach_payment_method(&self, method_id: &str) -> BillingResult<()> {
        let pm_id = parse_payment_method_id(method_id)?;

        stripe::PaymentMethod::detach(self.stripe.inner(), &pm_id)
            .await
            .map_err(Self::map_attach_error)?;

        Ok(())
    }

    async fn set_default_payment_method(
        &self,
        customer_id: &str,
        method_id: &str,
    ) -> BillingResult<()> {
        let customer_id = parse_customer_id(customer_id)?;

        let params = stripe::UpdateCustomer {
            invoice_settings: Some(stripe::CustomerInvoiceSettings {
                default_payment_method: Some(method_id.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        stripe::Customer::update(self.stripe.inner(), &customer_id, params).await?;

        Ok(())
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        amount_minor_units: i64,
        cycle: BillingCycle,
    ) -> BillingResult<ProviderSubscription> {
        let customer_id = parse_customer_id(customer_id)?;

        let mut params = stripe::CreateSubscription::new(customer_id);
        params.items = Some(vec![stripe::CreateSubscriptionItems {
            price_data: Some(self.price_data(amount_minor_units, cycle)?),
            quantity: Some(1),
            ..Default::default()
        }]);
        // Surface the first invoice's payment intent so the caller can
        // complete on-session confirmation when the card requires it
        params.payment_behavior = Some(stripe::SubscriptionPaymentBehavior::DefaultIncomplete);
        params.expand = &["latest_invoice.payment_intent"];

        let subscription = stripe::Subscription::create(self.stripe.inner(), params).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            amount_minor_units = amount_minor_units,
            cycle = %cycle,
            "Created provider subscription"
        );

        provider_subscription(subscription)
    }

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        amount_minor_units: i64,
        cycle: BillingCycle,
    ) -> BillingResult<ProviderSubscription> {
        // Import the proration behavior enum from the subscription module (not subscription_item)
        use stripe::generated::billing::subscription::SubscriptionProrationBehavior;

        let sub_id = parse_subscription_id(subscription_id)?;

        // The existing item is replaced in place, so we need its id first
        let current = stripe::Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;
        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| BillingError::Internal("No subscription items found".to_string()))?;

        let params = stripe::UpdateSubscription {
            items: Some(vec![stripe::UpdateSubscriptionItems {
                id: Some(item_id),
                price_data: Some(self.price_data(amount_minor_units, cycle)?),
                ..Default::default()
            }]),
            // Charge/credit the prorated difference for the remaining period
            proration_behavior: Some(SubscriptionProrationBehavior::CreateProrations),
            ..Default::default()
        };

        let subscription = stripe::Subscription::update(self.stripe.inner(), &sub_id, params).await?;

        tracing::info!(
            subscription_id = %subscription.id,
            amount_minor_units = amount_minor_units,
            "Updated provider subscription price"
        );

        provider_subscription(subscription)
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = parse_subscription_id(subscription_id)?;

        let subscription = if at_period_end {
            let params = stripe::UpdateSubscription {
                cancel_at_period_end: Some(true),
                ..Default::default()
            };
            stripe::Subscription::update(self.stripe.inner(), &sub_id, params).await?
        } else {
            let params = stripe::CancelSubscription {
                cancellation_details: None,
                invoice_now: None,
                prorate: None,
            };
            stripe::Subscription::cancel(self.stripe.inner(), &sub_id, params).await?
        };

        tracing::info!(
            subscription_id = %subscription.id,
            at_period_end = at_period_end,
            "Cancelled provider subscription"
        );

        provider_subscription(subscription)
    }

    async fn preview_upcoming_invoice(
        &self,
        subscription_id: &str,
    ) -> BillingResult<UpcomingInvoice> {
        // async-stripe's typed upcoming-invoice params lag the current API,
        // so query the endpoint directly with the documented parameters
        let invoice: stripe::Invoice = self
            .stripe
            .inner()
            .get_query(
                "/invoices/upcoming",
                &UpcomingInvoiceQuery {
                    subscription: subscription_id,
                },
            )
            .await?;

        Ok(UpcomingInvoice {
            amount_due_minor_units: invoice.amount_due.unwrap_or(0),
            currency: invoice
                .currency
                .map(|c| c.to_string())
                .unwrap_or_else(|| self.stripe.config().currency.clone()),
            period_end: invoice
                .period_end
                .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn minor_units_rounds_half_up_once() {
        assert_eq!(to_minor_units(dec!(10)).unwrap(), 1000);
        assert_eq!(to_minor_units(dec!(10.005)).unwrap(), 1001);
        assert_eq!(to_minor_units(dec!(10.004)).unwrap(), 1000);
        assert_eq!(to_minor_units(dec!(0)).unwrap(), 0);
    }

    #[test]
    fn minor_units_preserves_decimal_sums() {
        // Three thirds summed in decimal units convert cleanly; converting
        // each term separately would have lost a cent
        let a = dec!(33.335);
        let b = dec!(33.335);
        let c = dec!(33.33);
        assert_eq!(to_minor_units(a + b + c).unwrap(), 10000);
    }
}
