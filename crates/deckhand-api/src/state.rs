//! Application state.

use deckhand_trigger::TriggerOrchestrator;
use sqlx::PgPool;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub orchestrator: Arc<TriggerOrchestrator>,
    /// Key for `X-Deckhand-Signature-256` on the external-CI webhook. Unsigned
    /// deliveries are accepted when unset.
    pub webhook_secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        orchestrator: Arc<TriggerOrchestrator>,
        webhook_secret: Option<String>,
    ) -> Self {
        Self {
            pool,
            orchestrator,
            webhook_secret: webhook_secret.map(Arc::from),
        }
    }
}
