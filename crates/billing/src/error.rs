//! Billing error types

use thiserror::Error;

/// Errors produced by the reconciler.
///
/// The split matters at the HTTP boundary: authentication and parse failures
/// must map to a 400 so Stripe does not retry a request that can never
/// succeed, while transient dependency failures map to a 500 so Stripe's own
/// redelivery retries the whole event.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("stripe api error: {0}")]
    Api(String),

    #[error("database error: {0}")]
    Database(String),
}

impl BillingError {
    /// True when a retry (local or via Stripe redelivery) can plausibly help.
    pub fn is_retriable(&self) -> bool {
        matches!(self, BillingError::Api(_) | BillingError::Database(_))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::Api(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
