//! Account/subscription store
//!
//! All durable state the reconciler touches, behind a trait so handlers can
//! be exercised against an in-memory store in tests. Every write is scoped to
//! one account and uses update-or-insert semantics; nothing here needs a
//! multi-row transaction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::subscriptions::{SubscriptionRecord, SubscriptionStatus};

/// A platform user, as far as billing is concerned.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    /// Stripe's customer id; set lazily the first time an event resolves to
    /// this account. At most one account may claim a given id.
    pub stripe_customer_id: Option<String>,
}

/// Discrete grant or consumption of prepaid credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditKind {
    Purchase,
    Refund,
    Bonus,
    Consumption,
}

impl CreditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditKind::Purchase => "purchase",
            CreditKind::Refund => "refund",
            CreditKind::Bonus => "bonus",
            CreditKind::Consumption => "consumption",
        }
    }
}

/// Immutable ledger entry; corrections are new offsetting entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditEntry {
    pub account_id: Uuid,
    pub amount: i32,
    pub kind: CreditKind,
    pub description: String,
    /// Dedupe key, e.g. the checkout session id that paid for the grant.
    pub reference_id: Option<String>,
}

/// Terminal outcome recorded against a claimed webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Ok,
    Error,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Ok => "ok",
            EventOutcome::Error => "error",
        }
    }
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn account_by_id(&self, id: Uuid) -> BillingResult<Option<Account>>;

    async fn account_by_customer_id(&self, customer_id: &str) -> BillingResult<Option<Account>>;

    /// Case-insensitive email lookup. Emails are not unique across time; the
    /// oldest matching account wins.
    async fn account_by_email(&self, email: &str) -> BillingResult<Option<Account>>;

    /// Backfill the account's customer id. Returns false when the write was
    /// skipped because another account already claims the id.
    async fn set_customer_id(&self, account_id: Uuid, customer_id: &str) -> BillingResult<bool>;

    /// Update-or-insert keyed on account. Returns false when the stored
    /// record reflects a later provider observation (stale write skipped).
    async fn upsert_subscription(&self, record: &SubscriptionRecord) -> BillingResult<bool>;

    async fn subscription_for_account(
        &self,
        account_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Append a ledger entry. Returns false when an entry with the same
    /// reference id already exists (duplicate delivery; grant skipped).
    async fn append_credit_entry(&self, entry: &CreditEntry) -> BillingResult<bool>;

    async fn credit_balance(&self, account_id: Uuid) -> BillingResult<i64>;

    /// Atomically claim exclusive processing rights for a provider event.
    /// Claimable when unseen, previously errored, or stuck in `processing`
    /// past the stuck-timeout. Returns false for duplicates of an event that
    /// already processed successfully or is actively being processed.
    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool>;

    async fn finish_event(
        &self,
        event_id: &str,
        outcome: EventOutcome,
        error_message: Option<&str>,
    ) -> BillingResult<()>;
}

/// How long a `processing` claim may sit before a redelivery may reclaim it.
const STUCK_CLAIM_TIMEOUT_MINUTES: i32 = 5;

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    account_id: Uuid,
    stripe_subscription_id: Option<String>,
    plan_price_id: Option<String>,
    status: String,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    updated_at: OffsetDateTime,
}

impl From<SubscriptionRow> for SubscriptionRecord {
    fn from(row: SubscriptionRow) -> Self {
        SubscriptionRecord {
            account_id: row.account_id,
            stripe_subscription_id: row.stripe_subscription_id,
            plan_price_id: row.plan_price_id,
            status: SubscriptionStatus::from_stored(&row.status),
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            updated_at: row.updated_at,
        }
    }
}

/// Postgres-backed store.
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn account_by_id(&self, id: Uuid) -> BillingResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT id, email, stripe_customer_id FROM accounts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn account_by_customer_id(&self, customer_id: &str) -> BillingResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            "SELECT id, email, stripe_customer_id FROM accounts WHERE stripe_customer_id = $1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn account_by_email(&self, email: &str) -> BillingResult<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            r#"
            SELECT id, email, stripe_customer_id
            FROM accounts
            WHERE LOWER(email) = LOWER($1)
            ORDER BY created_at
            LIMIT 1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn set_customer_id(&self, account_id: Uuid, customer_id: &str) -> BillingResult<bool> {
        // The NOT EXISTS guard preserves the uniqueness invariant even when
        // two deliveries race; the UNIQUE constraint is the backstop.
        let result = sqlx::query(
            r#"
            UPDATE accounts SET stripe_customer_id = $2
            WHERE id = $1
              AND NOT EXISTS (
                  SELECT 1 FROM accounts other
                  WHERE other.stripe_customer_id = $2 AND other.id <> $1
              )
            "#,
        )
        .bind(account_id)
        .bind(customer_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_subscription(&self, record: &SubscriptionRecord) -> BillingResult<bool> {
        // Absent fields keep their stored values; the WHERE clause skips
        // writes older than what the row already reflects, so out-of-order
        // redeliveries converge on the latest-known provider status.
        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions
                (account_id, stripe_subscription_id, plan_price_id, status,
                 current_period_start, current_period_end, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (account_id) DO UPDATE SET
                stripe_subscription_id =
                    COALESCE(EXCLUDED.stripe_subscription_id, subscriptions.stripe_subscription_id),
                plan_price_id = COALESCE(EXCLUDED.plan_price_id, subscriptions.plan_price_id),
                status = EXCLUDED.status,
                current_period_start =
                    COALESCE(EXCLUDED.current_period_start, subscriptions.current_period_start),
                current_period_end =
                    COALESCE(EXCLUDED.current_period_end, subscriptions.current_period_end),
                updated_at = EXCLUDED.updated_at
            WHERE subscriptions.updated_at <= EXCLUDED.updated_at
            "#,
        )
        .bind(record.account_id)
        .bind(record.stripe_subscription_id.as_deref())
        .bind(record.plan_price_id.as_deref())
        .bind(record.status.as_str())
        .bind(record.current_period_start)
        .bind(record.current_period_end)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn subscription_for_account(
        &self,
        account_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT account_id, stripe_subscription_id, plan_price_id, status,
                   current_period_start, current_period_end, updated_at
            FROM subscriptions
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SubscriptionRecord::from))
    }

    async fn append_credit_entry(&self, entry: &CreditEntry) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO credit_ledger (account_id, amount, kind, description, reference_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (reference_id) DO NOTHING
            "#,
        )
        .bind(entry.account_id)
        .bind(entry.amount)
        .bind(entry.kind.as_str())
        .bind(&entry.description)
        .bind(entry.reference_id.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn credit_balance(&self, account_id: Uuid) -> BillingResult<i64> {
        let (balance,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM credit_ledger WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(balance)
    }

    async fn claim_event(&self, event_id: &str, event_type: &str) -> BillingResult<bool> {
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events (stripe_event_id, event_type, outcome, received_at)
            VALUES ($1, $2, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                outcome = 'processing',
                error_message = NULL,
                received_at = NOW()
            WHERE webhook_events.outcome = 'error'
               OR (webhook_events.outcome = 'processing'
                   AND webhook_events.received_at < NOW() - make_interval(mins => $3))
            RETURNING stripe_event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(STUCK_CLAIM_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.is_some())
    }

    async fn finish_event(
        &self,
        event_id: &str,
        outcome: EventOutcome,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET outcome = $2, error_message = $3, finished_at = NOW()
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(outcome.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
