//! CD trigger orchestration for deckhand.
//!
//! Turns CI completions, stage completions, manual requests and bulk
//! actions into deployments. Releases are rendered by the [`release`]
//! engine and driven to a terminal status by the [`ReleaseCoordinator`],
//! which keeps at most one release in flight per pipeline. Messages arrive
//! through a PostgreSQL queue claimed with `SKIP LOCKED`.

pub mod coordinator;
pub mod custom_tag;
pub mod deps;
pub mod gates;
pub mod orchestrator;
pub mod queue;
pub mod recorder;
pub mod release;
pub mod stage;
pub mod subscriber;
pub mod worker;

#[cfg(test)]
mod testing;

pub use coordinator::{CancelReason, ReleaseCoordinator};
pub use deps::{BuildError, Collaborators, CollaboratorsBuilder};
pub use orchestrator::{Started, TriggerOrchestrator};
pub use queue::PgMessageQueue;
pub use recorder::StatusRecorder;
pub use stage::{StageRequest, StageRunner};
pub use subscriber::{EventSubscriber, SUBSCRIBED_TOPICS};
pub use worker::{StatusWatcher, SubscriberWorker};
