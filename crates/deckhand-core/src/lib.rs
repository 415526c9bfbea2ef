//! Core domain types and traits for the deckhand CD trigger core.
//!
//! This crate contains:
//! - Entity identifiers and the error type
//! - Pipelines, artifacts, workflows, runners and timelines
//! - Release records, configuration snapshots and deployment outcomes
//! - Collaborator traits: executor, Helm, GitOps, ArgoCD, cluster reads,
//!   messaging, registries and supporting services

pub mod artifact;
pub mod deployer;
pub mod error;
pub mod events;
pub mod executor;
pub mod history;
pub mod id;
pub mod pipeline;
pub mod release;
pub mod secret;
pub mod services;
pub mod tag;
pub mod timeline;
pub mod workflow;

pub use error::{Error, Result};
pub use id::{ArtifactId, OverrideId, PipelineId, ReservationId, RunnerId, WorkflowId};
