//! Webhook processing
//!
//! Entry point for provider deliveries: verify the signature over the exact
//! raw bytes, decode the envelope, claim the event id, then dispatch to the
//! per-type handler. Handlers are idempotent and tolerate out-of-order
//! delivery, so a redelivered or replayed event converges instead of
//! double-applying.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{retry_transient, StripeGateway};
use crate::error::{BillingError, BillingResult};
use crate::events::{
    CheckoutSessionEvent, EventEnvelope, EventKind, InvoiceEvent, SubscriptionEvent,
};
use crate::identity::{IdentityHints, IdentityResolver, Resolution};
use crate::packages::find_package;
use crate::store::{AccountStore, CreditEntry, CreditKind, EventOutcome};
use crate::subscriptions::{SubscriptionRecord, SubscriptionStatus};

/// Maximum age (and future skew) of a signed timestamp, in seconds.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Metadata key carrying the internal account id on sessions/subscriptions.
const METADATA_ACCOUNT_KEY: &str = "userId";
/// Metadata key carrying the purchased credit package id.
const METADATA_PACKAGE_KEY: &str = "packageId";

pub struct WebhookHandler {
    gateway: Arc<dyn StripeGateway>,
    store: Arc<dyn AccountStore>,
    resolver: IdentityResolver,
    webhook_secret: String,
}

impl WebhookHandler {
    pub fn new(
        gateway: Arc<dyn StripeGateway>,
        store: Arc<dyn AccountStore>,
        webhook_secret: impl Into<String>,
    ) -> Self {
        let resolver = IdentityResolver::new(Arc::clone(&store), Arc::clone(&gateway));
        Self {
            gateway,
            store,
            resolver,
            webhook_secret: webhook_secret.into(),
        }
    }

    /// Verify the `Stripe-Signature` header against the raw body and decode
    /// the envelope. The body must be the exact bytes received; any
    /// re-serialization breaks the signature.
    pub fn verify_event(&self, payload: &[u8], signature_header: &str) -> BillingResult<EventEnvelope> {
        self.verify_signature(payload, signature_header, OffsetDateTime::now_utc())?;
        EventEnvelope::parse(payload)
    }

    fn verify_signature(
        &self,
        payload: &[u8],
        header: &str,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<Vec<u8>> = Vec::new();
        for part in header.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => timestamp = value.parse().ok(),
                // Multiple v1 entries appear during secret rotation.
                "v1" => {
                    if let Ok(bytes) = hex::decode(value) {
                        candidates.push(bytes);
                    }
                }
                _ => {}
            }
        }
        let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
        if candidates.is_empty() {
            return Err(BillingError::WebhookSignatureInvalid);
        }
        if (now.unix_timestamp() - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let key = self
            .webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(&self.webhook_secret);
        let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes())
            .map_err(|_| BillingError::WebhookSignatureInvalid)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        let expected = mac.finalize().into_bytes();

        let matched = candidates
            .iter()
            .any(|candidate| candidate.ct_eq(expected.as_slice()).into());
        if matched {
            Ok(())
        } else {
            Err(BillingError::WebhookSignatureInvalid)
        }
    }

    /// Process one verified event to completion.
    ///
    /// Unrecognized event types are acknowledged without touching the store.
    /// Recognized ones are claimed by event id first; duplicates of an event
    /// that already succeeded short-circuit here.
    pub async fn handle_event(&self, envelope: &EventEnvelope) -> BillingResult<()> {
        let kind = envelope.kind()?;
        if matches!(kind, EventKind::Ignored) {
            tracing::debug!(
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                "Ignoring unhandled event type"
            );
            return Ok(());
        }

        if !self.store.claim_event(&envelope.id, &envelope.event_type).await? {
            tracing::info!(
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                "Duplicate delivery; event already processed or in flight"
            );
            return Ok(());
        }

        let result = self.dispatch(envelope, kind).await;
        match &result {
            Ok(()) => {
                self.store
                    .finish_event(&envelope.id, EventOutcome::Ok, None)
                    .await?;
            }
            Err(err) => {
                tracing::error!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    error = %err,
                    "Event processing failed"
                );
                self.store
                    .finish_event(&envelope.id, EventOutcome::Error, Some(&err.to_string()))
                    .await?;
            }
        }
        result
    }

    async fn dispatch(&self, envelope: &EventEnvelope, kind: EventKind) -> BillingResult<()> {
        match kind {
            EventKind::CheckoutCompleted(session) => {
                self.checkout_completed(envelope, &session).await
            }
            EventKind::SubscriptionCreated(sub) | EventKind::SubscriptionUpdated(sub) => {
                self.subscription_observed(envelope, &sub, None).await
            }
            EventKind::SubscriptionDeleted(sub) => {
                self.subscription_observed(envelope, &sub, Some(SubscriptionStatus::Canceled))
                    .await
            }
            EventKind::InvoicePaid(invoice) => self.invoice_paid(envelope, &invoice).await,
            EventKind::InvoicePaymentFailed(invoice) => {
                self.invoice_payment_failed(envelope, &invoice).await
            }
            EventKind::Ignored => Ok(()),
        }
    }

    async fn checkout_completed(
        &self,
        envelope: &EventEnvelope,
        session: &CheckoutSessionEvent,
    ) -> BillingResult<()> {
        let hints = IdentityHints {
            account_id: session
                .meta(METADATA_ACCOUNT_KEY)
                .or(session.client_reference_id.as_deref())
                .and_then(parse_account_id),
            customer_id: session.customer.clone(),
            email: session.customer_email.clone(),
        };
        let Resolution::Resolved(account) = self.resolver.resolve(&hints).await? else {
            tracing::warn!(
                event_id = %envelope.id,
                session_id = %session.id,
                "Checkout session could not be matched to an account"
            );
            return Ok(());
        };

        if session.is_subscription_mode() {
            let Some(subscription_id) = session.subscription.as_deref() else {
                tracing::warn!(
                    event_id = %envelope.id,
                    session_id = %session.id,
                    "Subscription-mode session carries no subscription id"
                );
                return Ok(());
            };
            // The session's embedded state may already be stale; fetch the
            // canonical subscription before writing.
            let snapshot = self.fetch_subscription(subscription_id).await?;
            let record = SubscriptionRecord::from_snapshot(
                account.id,
                &snapshot,
                OffsetDateTime::now_utc(),
            );
            self.store.upsert_subscription(&record).await?;
            tracing::info!(
                event_id = %envelope.id,
                account_id = %account.id,
                subscription_id = %snapshot.id,
                status = %record.status,
                "Subscription activated from checkout"
            );
            return Ok(());
        }

        let Some(package_id) = session.meta(METADATA_PACKAGE_KEY) else {
            tracing::debug!(
                event_id = %envelope.id,
                session_id = %session.id,
                "Payment-mode session without a package id; nothing to grant"
            );
            return Ok(());
        };
        let Some(package) = find_package(package_id) else {
            tracing::warn!(
                event_id = %envelope.id,
                session_id = %session.id,
                %package_id,
                "Unknown credit package in session metadata; no credits granted"
            );
            return Ok(());
        };

        let entry = CreditEntry {
            account_id: account.id,
            amount: package.total_credits(),
            kind: CreditKind::Purchase,
            description: format!("{} purchase", package.name),
            reference_id: Some(session.id.clone()),
        };
        if self.store.append_credit_entry(&entry).await? {
            tracing::info!(
                event_id = %envelope.id,
                account_id = %account.id,
                %package_id,
                credits = package.total_credits(),
                "Credits granted"
            );
        } else {
            tracing::info!(
                event_id = %envelope.id,
                session_id = %session.id,
                "Credit grant already recorded for this session; skipping"
            );
        }
        Ok(())
    }

    /// Apply one subscription observation from an event body. `forced_status`
    /// overrides the provider status (deleted events always land canceled).
    async fn subscription_observed(
        &self,
        envelope: &EventEnvelope,
        sub: &SubscriptionEvent,
        forced_status: Option<SubscriptionStatus>,
    ) -> BillingResult<()> {
        let hints = IdentityHints {
            account_id: sub.meta(METADATA_ACCOUNT_KEY).and_then(parse_account_id),
            customer_id: sub.customer.clone(),
            email: None,
        };
        let Resolution::Resolved(account) = self.resolver.resolve(&hints).await? else {
            tracing::warn!(
                event_id = %envelope.id,
                subscription_id = %sub.id,
                "Subscription event could not be matched to an account"
            );
            return Ok(());
        };

        let status =
            forced_status.unwrap_or_else(|| SubscriptionStatus::from_provider(&sub.status));
        let record = SubscriptionRecord {
            account_id: account.id,
            stripe_subscription_id: Some(sub.id.clone()),
            plan_price_id: sub.plan_price_id().map(str::to_owned),
            status,
            current_period_start: sub
                .period_start()
                .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
            current_period_end: sub
                .period_end()
                .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
            updated_at: envelope.occurred_at(),
        };
        if self.store.upsert_subscription(&record).await? {
            tracing::info!(
                event_id = %envelope.id,
                account_id = %account.id,
                subscription_id = %sub.id,
                status = %status,
                "Subscription state updated"
            );
        } else {
            tracing::debug!(
                event_id = %envelope.id,
                subscription_id = %sub.id,
                "Stale subscription observation skipped"
            );
        }
        Ok(())
    }

    async fn invoice_paid(
        &self,
        envelope: &EventEnvelope,
        invoice: &InvoiceEvent,
    ) -> BillingResult<()> {
        let Some(subscription_id) = invoice.subscription.as_deref() else {
            tracing::debug!(
                event_id = %envelope.id,
                invoice_id = %invoice.id,
                "Invoice is not tied to a subscription; nothing to reconcile"
            );
            return Ok(());
        };
        let hints = IdentityHints {
            account_id: None,
            customer_id: invoice.customer.clone(),
            email: invoice.customer_email.clone(),
        };
        let Resolution::Resolved(account) = self.resolver.resolve(&hints).await? else {
            tracing::warn!(
                event_id = %envelope.id,
                invoice_id = %invoice.id,
                "Paid invoice could not be matched to an account"
            );
            return Ok(());
        };

        // Renewal invoices move the billing period forward; the canonical
        // object has the fresh period boundaries the invoice body lacks.
        let snapshot = self.fetch_subscription(subscription_id).await?;
        let record =
            SubscriptionRecord::from_snapshot(account.id, &snapshot, OffsetDateTime::now_utc());
        self.store.upsert_subscription(&record).await?;
        tracing::info!(
            event_id = %envelope.id,
            account_id = %account.id,
            subscription_id = %snapshot.id,
            status = %record.status,
            "Subscription refreshed after paid invoice"
        );
        Ok(())
    }

    async fn invoice_payment_failed(
        &self,
        envelope: &EventEnvelope,
        invoice: &InvoiceEvent,
    ) -> BillingResult<()> {
        let hints = IdentityHints {
            account_id: None,
            customer_id: invoice.customer.clone(),
            email: invoice.customer_email.clone(),
        };
        let Resolution::Resolved(account) = self.resolver.resolve(&hints).await? else {
            tracing::warn!(
                event_id = %envelope.id,
                invoice_id = %invoice.id,
                "Failed invoice could not be matched to an account"
            );
            return Ok(());
        };

        let record = SubscriptionRecord {
            account_id: account.id,
            stripe_subscription_id: invoice.subscription.clone(),
            plan_price_id: None,
            status: SubscriptionStatus::PastDue,
            current_period_start: None,
            current_period_end: None,
            updated_at: envelope.occurred_at(),
        };
        if self.store.upsert_subscription(&record).await? {
            tracing::warn!(
                event_id = %envelope.id,
                account_id = %account.id,
                invoice_id = %invoice.id,
                "Subscription marked past due after failed payment"
            );
        }
        Ok(())
    }

    async fn fetch_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<crate::client::SubscriptionSnapshot> {
        let gateway = Arc::clone(&self.gateway);
        retry_transient(|| {
            let gateway = Arc::clone(&gateway);
            let subscription_id = subscription_id.to_owned();
            async move { gateway.subscription(&subscription_id).await }
        })
        .await
    }
}

fn parse_account_id(raw: &str) -> Option<Uuid> {
    match Uuid::parse_str(raw) {
        Ok(id) => Some(id),
        Err(_) => {
            tracing::warn!(value = %raw, "Ignoring non-UUID account reference on event");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{signature_header, MemoryAccountStore, MockGateway};

    fn handler_with(store: Arc<MemoryAccountStore>, gateway: Arc<MockGateway>) -> WebhookHandler {
        WebhookHandler::new(gateway, store, "whsec_test_secret")
    }

    fn fresh_handler() -> WebhookHandler {
        handler_with(
            Arc::new(MemoryAccountStore::new()),
            Arc::new(MockGateway::new()),
        )
    }

    #[test]
    fn accepts_valid_signature() {
        let handler = fresh_handler();
        let payload = br#"{"id":"evt_1","type":"x","created":0,"data":{"object":{}}}"#;
        let now = OffsetDateTime::now_utc();
        let header = signature_header("whsec_test_secret", now.unix_timestamp(), payload);
        assert!(handler.verify_signature(payload, &header, now).is_ok());
    }

    #[test]
    fn rejects_wrong_secret() {
        let handler = fresh_handler();
        let payload = b"{}";
        let now = OffsetDateTime::now_utc();
        let header = signature_header("whsec_other_secret", now.unix_timestamp(), payload);
        assert!(matches!(
            handler.verify_signature(payload, &header, now),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let handler = fresh_handler();
        let payload = b"{}";
        let now = OffsetDateTime::now_utc();
        let signed_at = now.unix_timestamp() - SIGNATURE_TOLERANCE_SECS - 1;
        let header = signature_header("whsec_test_secret", signed_at, payload);
        assert!(matches!(
            handler.verify_signature(payload, &header, now),
            Err(BillingError::WebhookSignatureInvalid)
        ));
    }

    #[test]
    fn rejects_future_timestamp_beyond_tolerance() {
        let handler = fresh_handler();
        let payload = b"{}";
        let now = OffsetDateTime::now_utc();
        let signed_at = now.unix_timestamp() + SIGNATURE_TOLERANCE_SECS + 10;
        let header = signature_header("whsec_test_secret", signed_at, payload);
        assert!(handler.verify_signature(payload, &header, now).is_err());
    }

    #[test]
    fn rejects_header_without_signature_component() {
        let handler = fresh_handler();
        let now = OffsetDateTime::now_utc();
        let header = format!("t={}", now.unix_timestamp());
        assert!(handler.verify_signature(b"{}", &header, now).is_err());
    }

    #[test]
    fn accepts_any_matching_v1_during_secret_rotation() {
        let handler = fresh_handler();
        let payload = b"rotation";
        let now = OffsetDateTime::now_utc();
        let ts = now.unix_timestamp();
        let old = signature_header("whsec_retired_secret", ts, payload);
        let current = signature_header("whsec_test_secret", ts, payload);
        // old header is "t=..,v1=..", splice its v1 in front of the current one
        let old_v1 = old.split_once(",").map(|(_, v1)| v1.to_owned());
        let current_v1 = current.split_once(",").map(|(_, v1)| v1.to_owned());
        let header = format!(
            "t={ts},{},{}",
            old_v1.unwrap_or_default(),
            current_v1.unwrap_or_default()
        );
        assert!(handler.verify_signature(payload, &header, now).is_ok());
    }

    #[test]
    fn secret_prefix_is_optional() {
        let bare = WebhookHandler::new(
            Arc::new(MockGateway::new()),
            Arc::new(MemoryAccountStore::new()),
            "test_secret",
        );
        let payload = b"prefix";
        let now = OffsetDateTime::now_utc();
        let header = signature_header("whsec_test_secret", now.unix_timestamp(), payload);
        assert!(bare.verify_signature(payload, &header, now).is_ok());
    }

    #[test]
    fn non_uuid_account_reference_is_ignored() {
        assert!(parse_account_id("not-a-uuid").is_none());
        assert!(parse_account_id("3fa85f64-5717-4562-b3fc-2c963f66afa6").is_some());
    }
}
