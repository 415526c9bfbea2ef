//! Release engine: configuration resolution, value merging, counter
//! allocation and shipping to Helm or GitOps.

pub mod autoscaling;
pub mod config_source;
pub mod counter;
pub mod engine;
pub mod merge;

pub use engine::{REQUEST_NOT_VALIDATED, ReleaseEngine, ReleaseReport};
