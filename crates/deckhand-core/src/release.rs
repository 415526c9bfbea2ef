//! Release records, configuration inputs and deployment outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::workflow::{NEW_DEPLOYMENT_INITIATED, RunnerStatus, WorkflowType};
use crate::{ArtifactId, OverrideId, PipelineId, RunnerId, WorkflowId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentType {
    Deploy,
    Stop,
    Start,
    #[default]
    Unknown,
}

impl DeploymentType {
    /// Stop and start requests hibernate or wake an app and skip the artifact gates.
    pub fn is_hibernate_request(&self) -> bool {
        matches!(self, DeploymentType::Stop | DeploymentType::Start)
    }

    /// Unknown requests are plain deploys.
    pub fn normalized(self) -> Self {
        match self {
            DeploymentType::Unknown => DeploymentType::Deploy,
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentType::Deploy => "DEPLOY",
            DeploymentType::Stop => "STOP",
            DeploymentType::Start => "START",
            DeploymentType::Unknown => "UNKNOWN",
        }
    }
}

impl std::str::FromStr for DeploymentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "DEPLOY" => DeploymentType::Deploy,
            "STOP" => DeploymentType::Stop,
            "START" => DeploymentType::Start,
            "UNKNOWN" | "" => DeploymentType::Unknown,
            other => return Err(format!("unknown deployment type: {other}")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideStatus {
    New,
    Success,
}

/// Where the configuration of a release comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentWithConfig {
    /// The currently saved configuration.
    #[default]
    LastSaved,
    /// The configuration snapshot of an earlier runner.
    SpecificTrigger,
}

/// A request to trigger a stage of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValuesOverrideRequest {
    pub pipeline_id: PipelineId,
    pub app_id: i64,
    pub env_id: i64,
    pub ci_artifact_id: ArtifactId,
    pub cd_workflow_type: WorkflowType,
    #[serde(default)]
    pub cd_workflow_id: Option<WorkflowId>,
    #[serde(default)]
    pub wfr_id: Option<RunnerId>,
    #[serde(default)]
    pub deployment_type: DeploymentType,
    #[serde(default)]
    pub deployment_with_config: DeploymentWithConfig,
    #[serde(default)]
    pub wfr_id_for_deployment_with_specific_trigger: Option<RunnerId>,
    /// Caller-supplied JSON merged over the release override.
    #[serde(default)]
    pub additional_override: Option<serde_json::Value>,
    pub triggered_by: i64,
    #[serde(default)]
    pub user_email: Option<String>,
    /// Message id of the event that produced the request.
    #[serde(default)]
    pub reference_id: Option<String>,
}

impl ValuesOverrideRequest {
    pub fn new(
        pipeline_id: PipelineId,
        ci_artifact_id: ArtifactId,
        cd_workflow_type: WorkflowType,
        triggered_by: i64,
    ) -> Self {
        Self {
            pipeline_id,
            app_id: 0,
            env_id: 0,
            ci_artifact_id,
            cd_workflow_type,
            cd_workflow_id: None,
            wfr_id: None,
            deployment_type: DeploymentType::Deploy,
            deployment_with_config: DeploymentWithConfig::LastSaved,
            wfr_id_for_deployment_with_specific_trigger: None,
            additional_override: None,
            triggered_by,
            user_email: None,
            reference_id: None,
        }
    }
}

/// The frozen record of a single release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOverride {
    pub id: OverrideId,
    pub pipeline_id: PipelineId,
    pub ci_artifact_id: ArtifactId,
    pub cd_workflow_id: WorkflowId,
    pub env_config_override_id: i64,
    pub pipeline_release_counter: i64,
    pub git_hash: Option<String>,
    pub commit_time: Option<DateTime<Utc>>,
    pub merged_values: serde_json::Value,
    pub release_override_values: serde_json::Value,
    pub deployment_type: DeploymentType,
    pub status: OverrideStatus,
    pub created_by: i64,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOverride {
    pub pipeline_id: PipelineId,
    pub ci_artifact_id: ArtifactId,
    pub cd_workflow_id: WorkflowId,
    pub env_config_override_id: i64,
    pub pipeline_release_counter: i64,
    pub deployment_type: DeploymentType,
    pub created_by: i64,
}

/// App-level chart with its default values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chart {
    pub id: i64,
    pub app_id: i64,
    pub chart_ref_id: i64,
    pub chart_name: String,
    pub chart_version: String,
    /// Template producing the release override, e.g. `{"image":"{{.Name}}:{{.Tag}}"}`.
    pub image_descriptor_template: String,
    /// App-level values with scoped variables already resolved.
    pub global_override: serde_json::Value,
    /// Chart directory inside the GitOps repository.
    pub chart_location: String,
    pub git_repo_url: String,
    pub is_app_metrics_enabled: bool,
    pub is_custom_chart: bool,
}

impl Chart {
    /// `(major, minor)` of the chart version; unparsable parts count as zero.
    pub fn version_parts(&self) -> (u32, u32) {
        let mut parts = self
            .chart_version
            .split('.')
            .map(|p| p.trim_start_matches('v').parse::<u32>().unwrap_or(0));
        (parts.next().unwrap_or(0), parts.next().unwrap_or(0))
    }
}

/// Environment-level values replacing the chart defaults for one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfigOverride {
    pub id: i64,
    pub chart_id: i64,
    pub target_environment: i64,
    pub env_override_values: serde_json::Value,
    /// When false the chart's global override is used instead of `env_override_values`.
    pub is_override: bool,
    pub is_app_metrics_enabled: Option<bool>,
    pub latest: bool,
}

/// Deployment strategy selected for a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub strategy: String,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKind {
    ConfigMap,
    Secret,
}

/// One configmap or secret definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigItem {
    pub name: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, rename = "esoSecretData", skip_serializing_if = "Option::is_none")]
    pub eso_secret_data: Option<serde_json::Value>,
}

/// App-level and env-level configmaps and secrets of one pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigMapSecretBundle {
    pub app_config_maps: Vec<ConfigItem>,
    pub env_config_maps: Vec<ConfigItem>,
    pub app_secrets: Vec<ConfigItem>,
    pub env_secrets: Vec<ConfigItem>,
}

/// Values templated into the chart's image descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseAttributes {
    pub name: String,
    pub tag: String,
    pub pipeline_name: String,
    pub release_version: i64,
    pub deployment_type: String,
    pub app: String,
    pub env: String,
    pub app_metrics: bool,
}

/// How a deploy attempt ended.
///
/// Every terminal runner transition of a release goes through one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum DeploymentOutcome {
    Succeeded,
    /// A newer runner replaced this one.
    SupersededBy(Option<RunnerId>),
    /// The release did not finish before the install deadline.
    Timeout { release: String, limit: Duration },
    FailedWith(String),
    /// The release context was cancelled for the given reason.
    Canceled(String),
}

impl DeploymentOutcome {
    pub fn runner_status(&self) -> RunnerStatus {
        match self {
            DeploymentOutcome::Succeeded => RunnerStatus::Succeeded,
            _ => RunnerStatus::Failed,
        }
    }

    pub fn message(&self) -> String {
        match self {
            DeploymentOutcome::Succeeded => String::new(),
            DeploymentOutcome::SupersededBy(_) => NEW_DEPLOYMENT_INITIATED.to_string(),
            DeploymentOutcome::Timeout { release, limit } => format!(
                "Deployment timeout: release {} took more than {} mins",
                release,
                limit.as_secs() / 60
            ),
            DeploymentOutcome::FailedWith(msg) => crate::error::truncate_message(msg),
            DeploymentOutcome::Canceled(reason) => reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        let outcome = DeploymentOutcome::Timeout {
            release: "payments-prod".to_string(),
            limit: Duration::from_secs(15 * 60),
        };
        assert_eq!(outcome.runner_status(), RunnerStatus::Failed);
        assert_eq!(
            outcome.message(),
            "Deployment timeout: release payments-prod took more than 15 mins"
        );
    }

    #[test]
    fn test_superseded_message() {
        let outcome = DeploymentOutcome::SupersededBy(Some(RunnerId(8)));
        assert_eq!(outcome.message(), NEW_DEPLOYMENT_INITIATED);
    }

    #[test]
    fn test_chart_version_parts() {
        let mut chart = Chart {
            id: 1,
            app_id: 1,
            chart_ref_id: 1,
            chart_name: "reference-chart".to_string(),
            chart_version: "4.18.1".to_string(),
            image_descriptor_template: String::new(),
            global_override: serde_json::json!({}),
            chart_location: "reference-chart_4-18-1".to_string(),
            git_repo_url: String::new(),
            is_app_metrics_enabled: false,
            is_custom_chart: false,
        };
        assert_eq!(chart.version_parts(), (4, 18));
        chart.chart_version = "v3.7".to_string();
        assert_eq!(chart.version_parts(), (3, 7));
    }

    #[test]
    fn test_unknown_deployment_type_is_deploy() {
        assert_eq!(DeploymentType::Unknown.normalized(), DeploymentType::Deploy);
        assert!(DeploymentType::Stop.is_hibernate_request());
        assert!(!DeploymentType::Deploy.is_hibernate_request());
    }
}
