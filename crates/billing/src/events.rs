//! Webhook event envelope
//!
//! Events are parsed into a tagged union keyed by the provider's event type,
//! with each variant carrying only the fields its handler needs. Validation
//! happens once at this boundary; handlers never poke at raw JSON.

use std::collections::HashMap;

use serde::Deserialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// The outer `{ id, type, created, data: { object } }` shape Stripe posts.
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix timestamp the provider created the event; used as the logical
    /// timestamp for convergent subscription writes.
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl EventEnvelope {
    pub fn parse(payload: &[u8]) -> BillingResult<Self> {
        serde_json::from_slice(payload).map_err(|e| BillingError::MalformedPayload(e.to_string()))
    }

    /// Logical timestamp of this event.
    pub fn occurred_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc())
    }

    /// Decode `data.object` into the variant for this event's type.
    pub fn kind(&self) -> BillingResult<EventKind> {
        let object = self.data.object.clone();
        let decode_err =
            |e: serde_json::Error| BillingError::MalformedPayload(format!("{}: {e}", self.event_type));
        let kind = match self.event_type.as_str() {
            "checkout.session.completed" => {
                EventKind::CheckoutCompleted(serde_json::from_value(object).map_err(decode_err)?)
            }
            "customer.subscription.created" => {
                EventKind::SubscriptionCreated(serde_json::from_value(object).map_err(decode_err)?)
            }
            "customer.subscription.updated" => {
                EventKind::SubscriptionUpdated(serde_json::from_value(object).map_err(decode_err)?)
            }
            "customer.subscription.deleted" => {
                EventKind::SubscriptionDeleted(serde_json::from_value(object).map_err(decode_err)?)
            }
            "invoice.paid" => {
                EventKind::InvoicePaid(serde_json::from_value(object).map_err(decode_err)?)
            }
            "invoice.payment_failed" => {
                EventKind::InvoicePaymentFailed(serde_json::from_value(object).map_err(decode_err)?)
            }
            _ => EventKind::Ignored,
        };
        Ok(kind)
    }
}

/// Recognized event types, decoded. Anything else is `Ignored`: acknowledged
/// so the provider does not retry events we intentionally skip.
#[derive(Debug, Clone)]
pub enum EventKind {
    CheckoutCompleted(CheckoutSessionEvent),
    SubscriptionCreated(SubscriptionEvent),
    SubscriptionUpdated(SubscriptionEvent),
    SubscriptionDeleted(SubscriptionEvent),
    InvoicePaid(InvoiceEvent),
    InvoicePaymentFailed(InvoiceEvent),
    Ignored,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSessionEvent {
    pub id: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

impl CheckoutSessionEvent {
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key).map(String::as_str)
    }

    pub fn is_subscription_mode(&self) -> bool {
        self.mode.as_deref() == Some("subscription")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionEvent {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    pub status: String,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
    #[serde(default)]
    pub items: Option<SubscriptionItems>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub price: Option<ItemPrice>,
    // Newer Stripe API versions move the period onto the line item.
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemPrice {
    pub id: String,
}

impl SubscriptionEvent {
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.as_ref()?.get(key).map(String::as_str)
    }

    fn first_item(&self) -> Option<&SubscriptionItem> {
        self.items.as_ref()?.data.first()
    }

    pub fn plan_price_id(&self) -> Option<&str> {
        self.first_item()?.price.as_ref().map(|p| p.id.as_str())
    }

    /// Subscription-level period, falling back to the first line item.
    pub fn period_start(&self) -> Option<i64> {
        self.current_period_start
            .or_else(|| self.first_item()?.current_period_start)
    }

    pub fn period_end(&self) -> Option<i64> {
        self.current_period_end
            .or_else(|| self.first_item()?.current_period_end)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceEvent {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
}
