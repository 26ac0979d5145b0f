//! Application state

use std::sync::Arc;

use clipforge_billing::WebhookHandler;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub webhooks: Arc<WebhookHandler>,
}
