//! Stripe gateway
//!
//! Outbound, read-only access to the payment provider: the reconciler never
//! trusts possibly-stale object snapshots embedded in events, so handlers
//! fetch the canonical customer/subscription by id. The trait seam exists so
//! tests can substitute a scripted gateway (see [`crate::mock`]).

use std::collections::HashMap;

use async_trait::async_trait;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};

/// Canonical subscription state as fetched from Stripe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub id: String,
    pub customer_id: Option<String>,
    /// Provider status string ("active", "trialing", "past_due", ...).
    pub status: String,
    pub plan_price_id: Option<String>,
    pub current_period_start: Option<i64>,
    pub current_period_end: Option<i64>,
    pub metadata: HashMap<String, String>,
}

/// Read-only payment-provider lookups used during reconciliation.
#[async_trait]
pub trait StripeGateway: Send + Sync {
    /// Fetch a customer's email by Stripe customer id.
    async fn customer_email(&self, customer_id: &str) -> BillingResult<Option<String>>;

    /// Fetch the canonical subscription object by id.
    async fn subscription(&self, subscription_id: &str) -> BillingResult<SubscriptionSnapshot>;
}

/// Gateway backed by the Stripe API via async-stripe.
pub struct LiveStripeGateway {
    client: stripe::Client,
}

impl LiveStripeGateway {
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            client: stripe::Client::new(secret_key),
        }
    }
}

#[async_trait]
impl StripeGateway for LiveStripeGateway {
    async fn customer_email(&self, customer_id: &str) -> BillingResult<Option<String>> {
        let id = customer_id
            .parse::<stripe::CustomerId>()
            .map_err(|e| BillingError::Api(e.to_string()))?;
        let customer = stripe::Customer::retrieve(&self.client, &id, &[]).await?;
        Ok(customer.email.clone())
    }

    async fn subscription(&self, subscription_id: &str) -> BillingResult<SubscriptionSnapshot> {
        let id = subscription_id
            .parse::<stripe::SubscriptionId>()
            .map_err(|e| BillingError::Api(e.to_string()))?;
        let sub = stripe::Subscription::retrieve(&self.client, &id, &[]).await?;

        let plan_price_id = sub
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.to_string());

        Ok(SubscriptionSnapshot {
            id: sub.id.to_string(),
            customer_id: Some(sub.customer.id().to_string()),
            status: sub.status.to_string(),
            plan_price_id,
            current_period_start: Some(sub.current_period_start),
            current_period_end: Some(sub.current_period_end),
            metadata: sub.metadata.clone().into_iter().collect(),
        })
    }
}

/// Run a provider lookup with at most one bounded retry.
///
/// Webhook deliveries run under Stripe's own delivery timeout, so handlers
/// must not retry indefinitely inline; after the single retry the error
/// surfaces and Stripe's redelivery retries the whole event.
pub(crate) async fn retry_transient<T, F, Fut>(op: F) -> BillingResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = BillingResult<T>>,
{
    let strategy = FixedInterval::from_millis(250).take(1);
    RetryIf::spawn(strategy, op, BillingError::is_retriable).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn retry_transient_retries_once_then_surfaces() {
        let calls = AtomicUsize::new(0);
        let result: BillingResult<()> = retry_transient(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BillingError::Api("timeout".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2, "initial call plus one retry");
    }

    #[tokio::test]
    async fn retry_transient_recovers_on_second_attempt() {
        let calls = AtomicUsize::new(0);
        let result = retry_transient(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(BillingError::Api("blip".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.ok(), Some(42));
    }

    #[tokio::test]
    async fn retry_transient_does_not_retry_permanent_errors() {
        let calls = AtomicUsize::new(0);
        let result: BillingResult<()> = retry_transient(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BillingError::WebhookSignatureInvalid) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
