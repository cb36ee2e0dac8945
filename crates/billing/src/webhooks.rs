//! Provider webhook handling
//!
//! Verifies event authenticity with the shared signing secret before any
//! JSON parsing, then dispatches by event type to the lifecycle manager.
//! Unrecognized event types are accepted and ignored so the provider does
//! not retry-storm us over events we do not consume.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::subscriptions::{ProviderSubscriptionState, SubscriptionService};

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamp tolerance in seconds
const TOLERANCE_SECS: i64 = 300;

/// A provider event, reduced to the fields this system consumes
#[derive(Debug, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: ProviderEventData,
}

#[derive(Debug, Deserialize)]
pub struct ProviderEventData {
    pub object: ProviderEventObject,
}

#[derive(Debug, Deserialize)]
pub struct ProviderEventObject {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: Option<bool>,
    /// Set on invoice events: the subscription the invoice belongs to
    #[serde(default)]
    pub subscription: Option<String>,
}

/// Webhook reconciler: authenticates inbound provider events and forwards
/// them to the lifecycle manager
pub struct WebhookReconciler {
    signing_secret: String,
    lifecycle: Arc<SubscriptionService>,
}

impl WebhookReconciler {
    pub fn new(signing_secret: String, lifecycle: Arc<SubscriptionService>) -> Self {
        Self {
            signing_secret,
            lifecycle,
        }
    }

    /// Verify the signature header against the raw payload.
    ///
    /// Header grammar: `t=<unix ts>,v1=<hex hmac>` (other schemes ignored).
    /// The HMAC-SHA256 is computed over `"{t}.{payload}"`. Rejects payloads
    /// older than the tolerance window to blunt replay.
    pub fn verify(&self, payload: &str, signature: &str) -> BillingResult<()> {
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<&str> = None;

        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1]),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or(BillingError::SignatureInvalid)?;
        let v1_signature = v1_signature.ok_or(BillingError::SignatureInvalid)?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > TOLERANCE_SECS {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::SignatureInvalid);
        }

        // The secret's "whsec_" prefix is not part of the key material
        let secret_key = self
            .signing_secret
            .strip_prefix("whsec_")
            .unwrap_or(&self.signing_secret);
        let signed_payload = format!("{}.{}", timestamp, payload);

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
            .map_err(|_| BillingError::SignatureInvalid)?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::SignatureInvalid);
        }

        Ok(())
    }

    /// Verify and dispatch a raw webhook payload.
    ///
    /// An invalid signature rejects before any parsing and never reaches the
    /// lifecycle manager. Unknown event types return Ok so the caller
    /// answers with HTTP success and the provider stops redelivering.
    pub async fn handle(&self, payload: &str, signature: &str) -> BillingResult<()> {
        self.verify(payload, signature)?;

        let event: ProviderEvent = serde_json::from_str(payload)
            .map_err(|e| BillingError::Validation(format!("malformed event payload: {}", e)))?;

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing provider webhook event"
        );

        let object = &event.data.object;
        match event.event_type.as_str() {
            "customer.subscription.updated" => {
                self.lifecycle
                    .apply_subscription_updated(ProviderSubscriptionState {
                        provider_subscription_id: object.id.clone(),
                        status: object.status.clone(),
                        current_period_start: object
                            .current_period_start
                            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
                        current_period_end: object
                            .current_period_end
                            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
                        cancel_at_period_end: object.cancel_at_period_end,
                    })
                    .await
            }
            "customer.subscription.deleted" => {
                self.lifecycle.apply_subscription_deleted(&object.id).await
            }
            "invoice.payment_succeeded" => {
                match &object.subscription {
                    Some(sub_id) => {
                        self.lifecycle.apply_invoice_payment_succeeded(sub_id).await
                    }
                    // An invoice without a subscription (one-off charge) is
                    // not ours to reconcile
                    None => Ok(()),
                }
            }
            "invoice.payment_failed" => match &object.subscription {
                Some(sub_id) => self.lifecycle.apply_invoice_payment_failed(sub_id).await,
                None => Ok(()),
            },
            other => {
                tracing::debug!(event_type = %other, "Ignoring unhandled webhook event type");
                Ok(())
            }
        }
    }
}
