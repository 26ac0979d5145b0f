//! Stripe webhook endpoint
//!
//! The body must reach signature verification as the exact bytes Stripe
//! sent, so the handler takes `Bytes` rather than a JSON extractor.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

const SIGNATURE_HEADER: &str = "stripe-signature";

/// POST /api/stripe/webhook
///
/// 400 tells Stripe the delivery will never succeed (bad signature or
/// unparseable payload); 500 asks it to redeliver; everything else is
/// acknowledged with 200 so Stripe stops retrying.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<Value>) {
    let Some(signature) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
        tracing::warn!("Webhook delivery without a Stripe-Signature header");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing Stripe-Signature header" })),
        );
    };

    let envelope = match state.webhooks.verify_event(&body, signature) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::warn!(error = %err, "Rejected webhook delivery");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid webhook payload" })),
            );
        }
    };

    match state.webhooks.handle_event(&envelope).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "received": true }))),
        Err(err) if err.is_retriable() => {
            tracing::error!(event_id = %envelope.id, error = %err, "Transient webhook failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "event processing failed" })),
            )
        }
        Err(err) => {
            tracing::warn!(event_id = %envelope.id, error = %err, "Unprocessable webhook event");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid webhook payload" })),
            )
        }
    }
}
