//! Subscription state mapping
//!
//! Stripe reports an absolute subscription status on every event; the
//! reconciler maps it onto the internal status vocabulary and writes it with
//! an account-keyed upsert. Because each write carries the absolute status
//! (plus the logical timestamp of the observation), final state converges
//! regardless of delivery order.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::SubscriptionSnapshot;

/// Internal subscription status.
///
/// `Unknown` is a passthrough for provider statuses we do not map; it is
/// logged and stored rather than silently dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
    Incomplete,
    Unknown,
}

impl SubscriptionStatus {
    pub fn from_provider(status: &str) -> Self {
        match status {
            "active" | "trialing" => SubscriptionStatus::Active,
            "past_due" | "unpaid" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            "incomplete" | "incomplete_expired" => SubscriptionStatus::Incomplete,
            other => {
                tracing::warn!(provider_status = %other, "Unmapped provider subscription status");
                SubscriptionStatus::Unknown
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Unknown => "unknown",
        }
    }

    /// Reverse of `as_str`, for rows read back from the store.
    pub fn from_stored(status: &str) -> Self {
        match status {
            "active" => SubscriptionStatus::Active,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            "incomplete" => SubscriptionStatus::Incomplete,
            _ => SubscriptionStatus::Unknown,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The billing state held for one account. One non-terminal record per
/// account; replays converge via update-in-place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub account_id: Uuid,
    pub stripe_subscription_id: Option<String>,
    pub plan_price_id: Option<String>,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    /// Logical timestamp of the provider observation this record reflects.
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Build a record from a canonical subscription snapshot.
    pub fn from_snapshot(
        account_id: Uuid,
        snapshot: &SubscriptionSnapshot,
        observed_at: OffsetDateTime,
    ) -> Self {
        Self {
            account_id,
            stripe_subscription_id: Some(snapshot.id.clone()),
            plan_price_id: snapshot.plan_price_id.clone(),
            status: SubscriptionStatus::from_provider(&snapshot.status),
            current_period_start: snapshot
                .current_period_start
                .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
            current_period_end: snapshot
                .current_period_end
                .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
            updated_at: observed_at,
        }
    }
}
