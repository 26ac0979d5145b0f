//! Test doubles
//!
//! Scripted gateway and in-memory store used by unit and route tests.
//! Compiled unconditionally so downstream crates can drive their own tests
//! against the same doubles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::{StripeGateway, SubscriptionSnapshot};
use crate::error::{BillingError, BillingResult};
use crate::store::{Account, AccountStore, CreditEntry, EventOutcome};
use crate::subscriptions::SubscriptionRecord;

/// Build a `Stripe-Signature` header value for `payload` signed at
/// `timestamp` with `secret` (with or without the `whsec_` prefix).
pub fn signature_header(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    let digest = hex::encode(mac.finalize().into_bytes());
    format!("t={timestamp},v1={digest}")
}

fn unpoisoned<'a, T>(
    result: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>,
) -> MutexGuard<'a, T> {
    result.unwrap_or_else(PoisonError::into_inner)
}

/// Gateway whose responses are scripted up front.
#[derive(Default)]
pub struct MockGateway {
    customers: Mutex<HashMap<String, Option<String>>>,
    subscriptions: Mutex<HashMap<String, SubscriptionSnapshot>>,
    /// Number of upcoming calls that fail with a transient API error.
    fail_next: AtomicUsize,
    pub customer_calls: AtomicUsize,
    pub subscription_calls: AtomicUsize,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_customer_email(&self, customer_id: &str, email: Option<&str>) {
        unpoisoned(self.customers.lock())
            .insert(customer_id.to_owned(), email.map(str::to_owned));
    }

    pub fn script_subscription(&self, snapshot: SubscriptionSnapshot) {
        unpoisoned(self.subscriptions.lock()).insert(snapshot.id.clone(), snapshot);
    }

    /// Fail the next `n` gateway calls with a transient error.
    pub fn fail_next_calls(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    fn maybe_fail(&self) -> BillingResult<()> {
        let remaining = self.fail_next.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_next.store(remaining - 1, Ordering::SeqCst);
            return Err(BillingError::Api("scripted transient failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl StripeGateway for MockGateway {
    async fn customer_email(&self, customer_id: &str) -> BillingResult<Option<String>> {
        self.customer_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_fail()?;
        Ok(unpoisoned(self.customers.lock())
            .get(customer_id)
            .cloned()
            .flatten())
    }

    async fn subscription(&self, subscription_id: &str) -> BillingResult<SubscriptionSnapshot> {
        self.subscription_calls.fetch_add(1, Ordering::SeqCst);
        self.maybe_fail()?;
        unpoisoned(self.subscriptions.lock())
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| BillingError::Api(format!("no such subscription: {subscription_id}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct EventRow {
    event_type: String,
    outcome: String,
    error_message: Option<String>,
}

#[derive(Default)]
struct MemoryState {
    accounts: Vec<Account>,
    subscriptions: HashMap<Uuid, SubscriptionRecord>,
    ledger: Vec<CreditEntry>,
    events: HashMap<String, EventRow>,
}

/// In-memory [`AccountStore`] mirroring the Postgres implementation's
/// conflict and staleness semantics.
#[derive(Default)]
pub struct MemoryAccountStore {
    state: Mutex<MemoryState>,
    /// Every trait-method invocation, reads included.
    pub calls: AtomicUsize,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_account(&self, email: &str, stripe_customer_id: Option<&str>) -> Uuid {
        let id = Uuid::new_v4();
        unpoisoned(self.state.lock()).accounts.push(Account {
            id,
            email: email.to_owned(),
            stripe_customer_id: stripe_customer_id.map(str::to_owned),
        });
        id
    }

    pub fn ledger_entries(&self, account_id: Uuid) -> Vec<CreditEntry> {
        unpoisoned(self.state.lock())
            .ledger
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect()
    }

    pub fn stored_subscription(&self, account_id: Uuid) -> Option<SubscriptionRecord> {
        unpoisoned(self.state.lock())
            .subscriptions
            .get(&account_id)
            .cloned()
    }

    pub fn event_outcome(&self, event_id: &str) -> Option<String> {
        unpoisoned(self.state.lock())
            .events
            .get(event_id)
            .map(|row| row.outcome.clone())
    }

    pub fn event_type(&self, event_id: &str) -> Option<String> {
        unpoisoned(self.state.lock())
            .events
            .get(event_id)
            .map(|row| row.event_type.clone())
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn tick(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn account_by_id(&self, id: Uuid) -> BillingResult<Option<Account>> {
        self.tick();
        Ok(unpoisoned(self.state.lock())
            .accounts
            .iter()
            .find(|a| a.id == id)
            .cloned())
    }

    async fn account_by_customer_id(&self, customer_id: &str) -> BillingResult<Option<Account>> {
        self.tick();
        Ok(unpoisoned(self.state.lock())
            .accounts
            .iter()
            .find(|a| a.stripe_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn account_by_email(&self, email: &str) -> BillingResult<Option<Account>> {
        self.tick();
        Ok(unpoisoned(self.state.lock())
            .accounts
            .iter()
            .find(|a| a.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn set_customer_id(&self, account_id: Uuid, customer_id: &str) -> BillingResult<bool> {
        self.tick();
        let mut state = unpoisoned(self.state.lock());
        let claimed_elsewhere = state
            .accounts
            .iter()
            .any(|a| a.id != account_id && a.stripe_customer_id.as_deref() == Some(customer_id));
        if claimed_elsewhere {
            return Ok(false);
        }
        match state.accounts.iter_mut().find(|a| a.id == account_id) {
            Some(account) => {
                account.stripe_customer_id = Some(customer_id.to_owned());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn upsert_subscription(&self, record: &SubscriptionRecord) -> BillingResult<bool> {
        self.tick();
        let mut state = unpoisoned(self.state.lock());
        match state.subscriptions.get_mut(&record.account_id) {
            Some(existing) => {
                if existing.updated_at > record.updated_at {
                    return Ok(false);
                }
                let merged = SubscriptionRecord {
                    account_id: record.account_id,
                    stripe_subscription_id: record
                        .stripe_subscription_id
                        .clone()
                        .or_else(|| existing.stripe_subscription_id.clone()),
                    plan_price_id: record
                        .plan_price_id
                        .clone()
                        .or_else(|| existing.plan_price_id.clone()),
                    status: record.status,
                    current_period_start: record
                        .current_period_start
                        .or(existing.current_period_start),
                    current_period_end: record.current_period_end.or(existing.current_period_end),
                    updated_at: record.updated_at,
                };
                *existing = merged;
                Ok(true)
            }
            None => {
                state.subscriptions.insert(record.account_id, record.clone());
                Ok(true)
            }
        }
    }

    async fn subscription_for_account(
        &self,
        account_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        self.tick();
        Ok(unpoisoned(self.state.lock())
            .subscriptions
            .get(&account_id)
            .cloned())
    }

    async fn append_credit_entry(&self, entry: &CreditEntry) -> BillingResult<bool> {
        self.tick();
        let mut state = unpoisoned(self.state.lock());
        if let Some(reference_id) = entry.reference_id.as_deref() {
            let duplicate = state
                .ledger
                .iter()
                .any(|e| e.reference_id.as_deref() == Some(reference_id));
            if duplicate {
                return Ok(false);
            }
        }
        state.ledger.push(entry.clone());
        Ok(true)
    }

    async fn credit_balance(&self, account_id: Uuid) -> BillingResult<i64> {
        self.tick();
        Ok(unpoisoned(self.state.lock())
            .ledger
            .iter()
            .filter(|e| e.account_id == account_id)
            .map(|e| i64::from(e.amount))
            .sum())
    }

    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool> {
        self.tick();
        let mut state = unpoisoned(self.state.lock());
        match state.events.get_mut(event_id) {
            Some(row) if row.outcome == "error" => {
                row.outcome = "processing".to_owned();
                row.error_message = None;
                Ok(true)
            }
            // The stuck-claim timeout is a wall-clock concern; in memory an
            // active claim simply blocks redelivery.
            Some(_) => Ok(false),
            None => {
                state.events.insert(
                    event_id.to_owned(),
                    EventRow {
                        event_type: event_type.to_owned(),
                        outcome: "processing".to_owned(),
                        error_message: None,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn finish_event(
        &self,
        event_id: &str,
        outcome: EventOutcome,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        self.tick();
        if let Some(row) = unpoisoned(self.state.lock()).events.get_mut(event_id) {
            row.outcome = outcome.as_str().to_owned();
            row.error_message = error_message.map(str::to_owned);
        }
        Ok(())
    }
}

/// Snapshot constructor for tests.
pub fn snapshot(
    id: &str,
    customer_id: &str,
    status: &str,
    price_id: &str,
    period: (i64, i64),
) -> SubscriptionSnapshot {
    SubscriptionSnapshot {
        id: id.to_owned(),
        customer_id: Some(customer_id.to_owned()),
        status: status.to_owned(),
        plan_price_id: Some(price_id.to_owned()),
        current_period_start: Some(period.0),
        current_period_end: Some(period.1),
        metadata: HashMap::new(),
    }
}

/// Fixed logical timestamp helper for tests.
pub fn at_unix(ts: i64) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(ts).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}
