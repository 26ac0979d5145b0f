//! Identity resolution
//!
//! Maps the identity hints carried by a provider event onto exactly one
//! internal account, trying the strongest hint first:
//!
//! 1. internal account id from event metadata,
//! 2. stored customer-id mapping,
//! 3. case-insensitive email match (fetching the email from the provider
//!    when the event does not carry one).
//!
//! Whenever resolution succeeds and the event carries a customer id that is
//! absent from or different to the account's stored one, the mapping is
//! backfilled or corrected so future events resolve at step 2. Failure to
//! resolve is not an error: the caller logs it and acknowledges the event.

use std::sync::Arc;

use uuid::Uuid;

use crate::client::{retry_transient, StripeGateway};
use crate::error::BillingResult;
use crate::store::{Account, AccountStore};

/// Identity hints extracted from one event, strongest first.
#[derive(Debug, Clone, Default)]
pub struct IdentityHints {
    /// Internal account id carried in event metadata or client reference.
    pub account_id: Option<Uuid>,
    pub customer_id: Option<String>,
    pub email: Option<String>,
}

impl IdentityHints {
    pub fn is_empty(&self) -> bool {
        self.account_id.is_none() && self.customer_id.is_none() && self.email.is_none()
    }
}

#[derive(Debug, Clone)]
pub enum Resolution {
    Resolved(Account),
    /// No hint matched an account. Non-fatal; the event is acknowledged.
    Unresolved,
}

pub struct IdentityResolver {
    store: Arc<dyn AccountStore>,
    gateway: Arc<dyn StripeGateway>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn AccountStore>, gateway: Arc<dyn StripeGateway>) -> Self {
        Self { store, gateway }
    }

    pub async fn resolve(&self, hints: &IdentityHints) -> BillingResult<Resolution> {
        if let Some(account) = self.lookup(hints).await? {
            self.backfill_customer_id(&account, hints.customer_id.as_deref())
                .await?;
            return Ok(Resolution::Resolved(account));
        }
        Ok(Resolution::Unresolved)
    }

    async fn lookup(&self, hints: &IdentityHints) -> BillingResult<Option<Account>> {
        if let Some(account_id) = hints.account_id {
            if let Some(account) = self.store.account_by_id(account_id).await? {
                return Ok(Some(account));
            }
            tracing::warn!(%account_id, "Event metadata names an account that does not exist");
        }

        if let Some(customer_id) = hints.customer_id.as_deref() {
            if let Some(account) = self.store.account_by_customer_id(customer_id).await? {
                return Ok(Some(account));
            }
        }

        let email = match hints.email.clone() {
            Some(email) => Some(email),
            None => match hints.customer_id.as_deref() {
                Some(customer_id) => {
                    let gateway = Arc::clone(&self.gateway);
                    retry_transient(|| {
                        let gateway = Arc::clone(&gateway);
                        let customer_id = customer_id.to_owned();
                        async move { gateway.customer_email(&customer_id).await }
                    })
                    .await?
                }
                None => None,
            },
        };

        if let Some(email) = email {
            if let Some(account) = self.store.account_by_email(&email).await? {
                return Ok(Some(account));
            }
        }

        Ok(None)
    }

    /// Record or correct the customer-id mapping. Skipped when the stored id
    /// already matches the event's, or when another account claims it
    /// (uniqueness holds; the conflict is logged, not fatal).
    async fn backfill_customer_id(
        &self,
        account: &Account,
        customer_id: Option<&str>,
    ) -> BillingResult<()> {
        let Some(customer_id) = customer_id else {
            return Ok(());
        };
        if account.stripe_customer_id.as_deref() == Some(customer_id) {
            return Ok(());
        }
        let written = self.store.set_customer_id(account.id, customer_id).await?;
        if !written {
            tracing::warn!(
                account_id = %account.id,
                %customer_id,
                "Customer id already claimed by another account; backfill skipped"
            );
        }
        Ok(())
    }
}
