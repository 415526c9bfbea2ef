//! API routes.

pub mod cd;
pub mod health;
pub mod webhooks;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1/cd", cd::router())
        .nest("/webhooks", webhooks::router())
        .merge(health::router())
        .with_state(state)
}
