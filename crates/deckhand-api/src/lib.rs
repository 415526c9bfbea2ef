//! HTTP surface for the deckhand CD trigger core.
//!
//! Manual triggers, bulk actions and stage cancellation under `/api/v1/cd`,
//! plus the signed external-CI webhook.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
