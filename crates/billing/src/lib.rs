// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Clipforge Billing Module
//!
//! Reconciles Stripe webhook events against internal accounts.
//!
//! ## Features
//!
//! - **Signature Verification**: HMAC-SHA256 over the raw delivery bytes
//! - **Identity Resolution**: metadata id, customer-id mapping, then email
//! - **Credit Purchases**: one-time checkout sessions append ledger grants
//! - **Subscription Sync**: account-keyed upserts that converge out of order
//! - **Idempotency**: per-event claims plus per-grant dedupe keys

pub mod client;
pub mod error;
pub mod events;
pub mod identity;
pub mod mock;
pub mod packages;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{LiveStripeGateway, StripeGateway, SubscriptionSnapshot};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    CheckoutSessionEvent, EventEnvelope, EventKind, InvoiceEvent, SubscriptionEvent,
};

// Identity
pub use identity::{IdentityHints, IdentityResolver, Resolution};

// Packages
pub use packages::{find_package, CreditPackage, CREDIT_PACKAGES};

// Store
pub use store::{
    Account, AccountStore, CreditEntry, CreditKind, EventOutcome, PgAccountStore,
};

// Subscriptions
pub use subscriptions::{SubscriptionRecord, SubscriptionStatus};

// Webhooks
pub use webhooks::WebhookHandler;
