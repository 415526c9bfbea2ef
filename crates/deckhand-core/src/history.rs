//! Configuration snapshots taken at release and stage-trigger time.
//!
//! A snapshot is attached to the runner that used it, so a later
//! "deploy with specific trigger" can replay that runner's exact inputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::release::{ConfigMapSecretBundle, StrategyConfig};
use crate::{PipelineId, RunnerId};

/// Deployment template as it was used by a release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentTemplateHistory {
    pub pipeline_id: PipelineId,
    /// Values with scoped-variable placeholders left unresolved.
    pub template: serde_json::Value,
    /// True when `template` came from the environment override.
    pub is_env_override: bool,
    pub env_config_override_id: i64,
    pub chart_ref_id: i64,
    pub chart_version: String,
    pub image_descriptor_template: String,
    pub is_app_metrics_enabled: bool,
    pub deployed_on: DateTime<Utc>,
    pub deployed_by: i64,
}

/// Everything a release read from configuration, frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub deployment_template: DeploymentTemplateHistory,
    pub config_maps_secrets: ConfigMapSecretBundle,
    pub strategy: Option<StrategyConfig>,
    pub db_migration: Option<serde_json::Value>,
    pub app_labels: BTreeMap<String, String>,
    /// Scoped variables resolved for this release, by name.
    pub variables: BTreeMap<String, String>,
}

/// The stage definition a pre/post runner was submitted with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageScriptHistory {
    pub runner_id: RunnerId,
    pub pipeline_id: PipelineId,
    pub stage_yaml: Option<String>,
    pub steps: serde_json::Value,
    pub triggered_on: DateTime<Utc>,
    pub triggered_by: i64,
}

/// Outcome of resource-filter evaluation for one trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterAudit {
    pub runner_id: RunnerId,
    pub filter_ids: Vec<i64>,
    pub allowed: bool,
    pub evaluated_on: DateTime<Utc>,
}
