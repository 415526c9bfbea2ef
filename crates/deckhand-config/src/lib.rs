//! Configuration for deckhand.
//!
//! This crate handles:
//! - System configuration (KDL file plus environment overrides)
//! - Image descriptor templating and scoped-variable substitution

pub mod error;
pub mod system;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    AutoscalingKeys, CdConfig, EndpointSettings, ExecutorSettings, GitOpsSettings, QueueSettings,
    parse_cd_config,
};
pub use variables::{ReleaseTemplate, referenced_variables, substitute_variables};
