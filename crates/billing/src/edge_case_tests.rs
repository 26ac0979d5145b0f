//! End-to-end handler scenarios
//!
//! Exercises the reconciliation guarantees against the in-memory store and
//! scripted gateway: idempotent grants, out-of-order convergence, identity
//! fallbacks, and redelivery after failure.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingError;
use crate::events::EventEnvelope;
use crate::mock::{signature_header, snapshot, MemoryAccountStore, MockGateway};
use crate::store::{AccountStore, CreditEntry, CreditKind};
use crate::subscriptions::SubscriptionStatus;
use crate::webhooks::WebhookHandler;

const SECRET: &str = "whsec_edge_case_secret";

fn setup() -> (Arc<MemoryAccountStore>, Arc<MockGateway>, WebhookHandler) {
    let store = Arc::new(MemoryAccountStore::new());
    let gateway = Arc::new(MockGateway::new());
    let handler = WebhookHandler::new(
        Arc::clone(&gateway) as Arc<dyn crate::client::StripeGateway>,
        Arc::clone(&store) as Arc<dyn crate::store::AccountStore>,
        SECRET,
    );
    (store, gateway, handler)
}

fn envelope(value: serde_json::Value) -> EventEnvelope {
    EventEnvelope::parse(value.to_string().as_bytes()).unwrap()
}

fn checkout_payment_event(event_id: &str, session_id: &str, account_id: Uuid) -> EventEnvelope {
    envelope(serde_json::json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "created": 1_700_000_000,
        "data": { "object": {
            "id": session_id,
            "mode": "payment",
            "customer": "cus_buyer",
            "metadata": { "packageId": "credit-15", "userId": account_id.to_string() }
        }}
    }))
}

fn subscription_event(event_id: &str, created: i64, status: &str) -> EventEnvelope {
    envelope(serde_json::json!({
        "id": event_id,
        "type": "customer.subscription.updated",
        "created": created,
        "data": { "object": {
            "id": "sub_1",
            "customer": "cus_sub",
            "status": status,
            "items": { "data": [ { "price": { "id": "price_basic_monthly" } } ] }
        }}
    }))
}

#[tokio::test]
async fn duplicate_checkout_grants_credits_exactly_once() {
    let (store, _gateway, handler) = setup();
    let account = store.seed_account("buyer@example.com", Some("cus_buyer"));
    // Pre-existing balance from an earlier promo.
    store
        .append_credit_entry(&CreditEntry {
            account_id: account,
            amount: 10,
            kind: CreditKind::Bonus,
            description: "signup bonus".into(),
            reference_id: Some("promo-1".into()),
        })
        .await
        .unwrap();

    // Same session delivered under two distinct event ids, as Stripe does
    // when a webhook endpoint is re-enabled.
    let first = checkout_payment_event("evt_a", "cs_once", account);
    let second = checkout_payment_event("evt_b", "cs_once", account);
    handler.handle_event(&first).await.unwrap();
    handler.handle_event(&second).await.unwrap();

    assert_eq!(store.credit_balance(account).await.unwrap(), 27);
    let grants: Vec<_> = store
        .ledger_entries(account)
        .into_iter()
        .filter(|e| e.kind == CreditKind::Purchase)
        .collect();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].reference_id.as_deref(), Some("cs_once"));
    assert_eq!(store.event_outcome("evt_a").as_deref(), Some("ok"));
    assert_eq!(store.event_outcome("evt_b").as_deref(), Some("ok"));
}

#[tokio::test]
async fn subscription_status_converges_regardless_of_delivery_order() {
    // canceled (later) then active (earlier): stale write must be skipped.
    let (store, _gateway, handler) = setup();
    let account = store.seed_account("sub@example.com", Some("cus_sub"));
    handler
        .handle_event(&subscription_event("evt_late", 2_000, "canceled"))
        .await
        .unwrap();
    handler
        .handle_event(&subscription_event("evt_early", 1_000, "active"))
        .await
        .unwrap();
    let record = store.stored_subscription(account).unwrap();
    assert_eq!(record.status, SubscriptionStatus::Canceled);

    // In-order delivery lands the same final state.
    let (store2, _gateway2, handler2) = setup();
    let account2 = store2.seed_account("sub@example.com", Some("cus_sub"));
    handler2
        .handle_event(&subscription_event("evt_early", 1_000, "active"))
        .await
        .unwrap();
    handler2
        .handle_event(&subscription_event("evt_late", 2_000, "canceled"))
        .await
        .unwrap();
    assert_eq!(
        store2.stored_subscription(account2).unwrap().status,
        record.status
    );
}

#[tokio::test]
async fn tampered_payload_is_rejected_before_any_store_access() {
    let (store, _gateway, handler) = setup();
    let payload = br#"{"id":"evt_t","type":"checkout.session.completed","created":0,"data":{"object":{"id":"cs_t"}}}"#;
    let now = OffsetDateTime::now_utc();
    let header = signature_header(SECRET, now.unix_timestamp(), payload);

    let mut tampered = payload.to_vec();
    tampered[10] ^= 0x01;
    let err = handler.verify_event(&tampered, &header).unwrap_err();
    assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    assert_eq!(store.call_count(), 0);

    // The untouched payload still verifies with the same header.
    assert!(handler.verify_event(payload, &header).is_ok());
}

#[tokio::test]
async fn unresolved_identity_is_acknowledged_not_errored() {
    let (store, _gateway, handler) = setup();
    let event = envelope(serde_json::json!({
        "id": "evt_nobody",
        "type": "checkout.session.completed",
        "created": 1_700_000_000,
        "data": { "object": {
            "id": "cs_nobody",
            "mode": "payment",
            "customer": "cus_stranger",
            "customer_email": "stranger@example.com",
            "metadata": { "packageId": "credit-5" }
        }}
    }));
    handler.handle_event(&event).await.unwrap();
    assert_eq!(store.event_outcome("evt_nobody").as_deref(), Some("ok"));
}

#[tokio::test]
async fn customer_id_backfill_skips_when_claimed_elsewhere() {
    let (store, _gateway, handler) = setup();
    let holder = store.seed_account("holder@example.com", Some("cus_shared"));
    let other = store.seed_account("other@example.com", None);

    // Metadata pins the event to `other`, but the customer id on the session
    // already belongs to `holder`.
    let event = envelope(serde_json::json!({
        "id": "evt_claim",
        "type": "checkout.session.completed",
        "created": 1_700_000_000,
        "data": { "object": {
            "id": "cs_claim",
            "mode": "payment",
            "customer": "cus_shared",
            "metadata": { "packageId": "credit-5", "userId": other.to_string() }
        }}
    }));
    handler.handle_event(&event).await.unwrap();

    // Grant lands on the metadata-resolved account; the mapping stays unique.
    assert_eq!(store.credit_balance(other).await.unwrap(), 5);
    let other_account = store.account_by_id(other).await.unwrap().unwrap();
    assert!(other_account.stripe_customer_id.is_none());
    let holder_account = store.account_by_id(holder).await.unwrap().unwrap();
    assert_eq!(holder_account.stripe_customer_id.as_deref(), Some("cus_shared"));
}

#[tokio::test]
async fn differing_customer_id_is_corrected_when_unclaimed() {
    let (store, _gateway, handler) = setup();
    // The stored mapping is stale, e.g. the customer was recreated in Stripe.
    let account = store.seed_account("moved@example.com", Some("cus_old"));

    let event = envelope(serde_json::json!({
        "id": "evt_remap",
        "type": "checkout.session.completed",
        "created": 1_700_000_000,
        "data": { "object": {
            "id": "cs_remap",
            "mode": "payment",
            "customer": "cus_new",
            "metadata": { "packageId": "credit-5", "userId": account.to_string() }
        }}
    }));
    handler.handle_event(&event).await.unwrap();

    // No other account claims cus_new, so the mapping is corrected.
    let refreshed = store.account_by_id(account).await.unwrap().unwrap();
    assert_eq!(refreshed.stripe_customer_id.as_deref(), Some("cus_new"));
    assert_eq!(store.credit_balance(account).await.unwrap(), 5);
}

#[tokio::test]
async fn mixed_event_types_converge_on_the_later_observation() {
    // subscription.updated(active) at t=2000, invoice.payment_failed at
    // t=1000 delivered late: the logically later active status must win.
    let failed_invoice = || {
        envelope(serde_json::json!({
            "id": "evt_inv_fail",
            "type": "invoice.payment_failed",
            "created": 1_000,
            "data": { "object": {
                "id": "in_late",
                "customer": "cus_sub",
                "subscription": "sub_1"
            }}
        }))
    };

    let (store, _gateway, handler) = setup();
    let account = store.seed_account("sub@example.com", Some("cus_sub"));
    handler
        .handle_event(&subscription_event("evt_active", 2_000, "active"))
        .await
        .unwrap();
    handler.handle_event(&failed_invoice()).await.unwrap();
    assert_eq!(
        store.stored_subscription(account).unwrap().status,
        SubscriptionStatus::Active
    );

    // Reverse arrival order lands on the same final state.
    let (store2, _gateway2, handler2) = setup();
    let account2 = store2.seed_account("sub@example.com", Some("cus_sub"));
    handler2.handle_event(&failed_invoice()).await.unwrap();
    assert_eq!(
        store2.stored_subscription(account2).unwrap().status,
        SubscriptionStatus::PastDue
    );
    handler2
        .handle_event(&subscription_event("evt_active", 2_000, "active"))
        .await
        .unwrap();
    assert_eq!(
        store2.stored_subscription(account2).unwrap().status,
        SubscriptionStatus::Active
    );
}

#[tokio::test]
async fn unknown_event_type_never_touches_the_store() {
    let (store, _gateway, handler) = setup();
    let event = envelope(serde_json::json!({
        "id": "evt_unknown",
        "type": "charge.refund.updated",
        "created": 0,
        "data": { "object": { "id": "re_1" } }
    }));
    handler.handle_event(&event).await.unwrap();
    assert_eq!(store.call_count(), 0);
    assert!(store.event_outcome("evt_unknown").is_none());
}

#[tokio::test]
async fn duplicate_event_id_short_circuits_at_the_claim() {
    let (store, gateway, handler) = setup();
    store.seed_account("renewal@example.com", Some("cus_renew"));
    gateway.script_subscription(snapshot(
        "sub_renew",
        "cus_renew",
        "active",
        "price_basic_monthly",
        (1_700_000_000, 1_702_592_000),
    ));
    let event = envelope(serde_json::json!({
        "id": "evt_same",
        "type": "invoice.paid",
        "created": 1_700_000_000,
        "data": { "object": {
            "id": "in_1",
            "customer": "cus_renew",
            "subscription": "sub_renew"
        }}
    }));

    handler.handle_event(&event).await.unwrap();
    handler.handle_event(&event).await.unwrap();
    // Second delivery never reached the gateway.
    assert_eq!(gateway.subscription_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transient_gateway_failure_surfaces_then_redelivery_succeeds() {
    let (store, gateway, handler) = setup();
    let account = store.seed_account("flaky@example.com", Some("cus_flaky"));
    gateway.script_subscription(snapshot(
        "sub_flaky",
        "cus_flaky",
        "active",
        "price_pro_monthly",
        (1_700_000_000, 1_702_592_000),
    ));
    let event = envelope(serde_json::json!({
        "id": "evt_flaky",
        "type": "invoice.paid",
        "created": 1_700_000_000,
        "data": { "object": {
            "id": "in_flaky",
            "customer": "cus_flaky",
            "subscription": "sub_flaky"
        }}
    }));

    // Both the call and its single inline retry fail.
    gateway.fail_next_calls(2);
    let err = handler.handle_event(&event).await.unwrap_err();
    assert!(err.is_retriable());
    assert_eq!(store.event_outcome("evt_flaky").as_deref(), Some("error"));
    assert!(store.stored_subscription(account).is_none());

    // Stripe redelivers; the errored claim is reclaimable and processing
    // completes.
    handler.handle_event(&event).await.unwrap();
    assert_eq!(store.event_outcome("evt_flaky").as_deref(), Some("ok"));
    let record = store.stored_subscription(account).unwrap();
    assert_eq!(record.status, SubscriptionStatus::Active);
    assert_eq!(record.plan_price_id.as_deref(), Some("price_pro_monthly"));
}

#[tokio::test]
async fn email_is_fetched_from_provider_when_event_lacks_it() {
    let (store, gateway, handler) = setup();
    // Account exists by email only; no customer mapping yet.
    let account = store.seed_account("Fetch.Me@Example.com", None);
    gateway.script_customer_email("cus_fetch", Some("fetch.me@example.com"));

    let event = envelope(serde_json::json!({
        "id": "evt_fetch",
        "type": "invoice.payment_failed",
        "created": 1_700_000_500,
        "data": { "object": {
            "id": "in_fetch",
            "customer": "cus_fetch"
        }}
    }));
    handler.handle_event(&event).await.unwrap();

    let record = store.stored_subscription(account).unwrap();
    assert_eq!(record.status, SubscriptionStatus::PastDue);
    // Resolution backfilled the customer mapping for next time.
    let refreshed = store.account_by_id(account).await.unwrap().unwrap();
    assert_eq!(refreshed.stripe_customer_id.as_deref(), Some("cus_fetch"));
}

#[tokio::test]
async fn deleted_subscription_lands_canceled_with_event_timestamp() {
    let (store, _gateway, handler) = setup();
    let account = store.seed_account("bye@example.com", Some("cus_bye"));
    let event = envelope(serde_json::json!({
        "id": "evt_bye",
        "type": "customer.subscription.deleted",
        "created": 1_700_100_000,
        "data": { "object": {
            "id": "sub_bye",
            "customer": "cus_bye",
            "status": "canceled"
        }}
    }));
    handler.handle_event(&event).await.unwrap();
    let record = store.stored_subscription(account).unwrap();
    assert_eq!(record.status, SubscriptionStatus::Canceled);
    assert_eq!(record.updated_at.unix_timestamp(), 1_700_100_000);
}

#[tokio::test]
async fn unknown_package_acknowledges_without_granting() {
    let (store, _gateway, handler) = setup();
    let account = store.seed_account("typo@example.com", Some("cus_typo"));
    let event = envelope(serde_json::json!({
        "id": "evt_typo",
        "type": "checkout.session.completed",
        "created": 1_700_000_000,
        "data": { "object": {
            "id": "cs_typo",
            "mode": "payment",
            "customer": "cus_typo",
            "metadata": { "packageId": "credit-9000" }
        }}
    }));
    handler.handle_event(&event).await.unwrap();
    assert_eq!(store.credit_balance(account).await.unwrap(), 0);
    assert_eq!(store.event_outcome("evt_typo").as_deref(), Some("ok"));
}
