//! CD pipeline definitions.
//!
//! Pipelines are created by an external configuration service. From the
//! trigger core's point of view they are read-only except for the
//! `deployment_app_created` flag.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::PipelineId;
use crate::workflow::WorkflowType;

/// Name of the ref-plugin that copies the built image to other registries.
pub const COPY_CONTAINER_IMAGE_PLUGIN: &str = "Copy container image";

/// How a pipeline reaches the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentAppType {
    /// Values are committed to git and synced by ArgoCD.
    #[serde(rename = "argo_cd")]
    GitOps,
    /// Values are installed through the Helm executor.
    Helm,
    /// Nothing is applied; the rendered manifest is offered for download.
    ManifestDownload,
}

impl DeploymentAppType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentAppType::GitOps => "argo_cd",
            DeploymentAppType::Helm => "helm",
            DeploymentAppType::ManifestDownload => "manifest_download",
        }
    }
}

impl std::str::FromStr for DeploymentAppType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "argo_cd" | "gitops" => Ok(DeploymentAppType::GitOps),
            "helm" => Ok(DeploymentAppType::Helm),
            "manifest_download" => Ok(DeploymentAppType::ManifestDownload),
            other => Err(format!("unknown deployment app type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    Automatic,
    Manual,
}

impl TriggerType {
    pub fn is_auto(&self) -> bool {
        matches!(self, TriggerType::Automatic)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Automatic => "AUTOMATIC",
            TriggerType::Manual => "MANUAL",
        }
    }
}

impl std::str::FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUTOMATIC" | "automatic" | "auto" => Ok(TriggerType::Automatic),
            "MANUAL" | "manual" => Ok(TriggerType::Manual),
            other => Err(format!("unknown trigger type: {other}")),
        }
    }
}

/// Approval requirement declared on a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    pub required_approvals: u32,
}

/// A deployment target: one app deployed to one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: PipelineId,
    pub name: String,
    pub app_id: i64,
    pub app_name: String,
    pub env_id: i64,
    pub env_name: String,
    pub cluster_id: i64,
    pub project_id: i64,
    /// Namespace the application is deployed into.
    pub namespace: String,
    pub is_prod: bool,
    /// CI pipeline whose artifacts feed this pipeline.
    pub ci_pipeline_id: i64,
    /// Upstream CD pipeline, for pipelines chained after another deployment.
    pub parent_pipeline_id: Option<PipelineId>,
    pub deployment_app_type: DeploymentAppType,
    pub trigger_type: TriggerType,
    pub pre_trigger_type: TriggerType,
    pub post_trigger_type: TriggerType,
    /// Free-form pre-stage definition, carried verbatim to the executor.
    pub pre_stage_yaml: Option<String>,
    pub post_stage_yaml: Option<String>,
    pub pre_runs_in_env: bool,
    pub post_runs_in_env: bool,
    pub deployment_app_created: bool,
    pub deployment_app_name: String,
    pub approval: Option<ApprovalConfig>,
}

impl Pipeline {
    /// Name of the Helm release / ArgoCD application, `<app>-<env>` when unset.
    pub fn app_release_name(&self) -> String {
        if self.deployment_app_name.is_empty() {
            format!("{}-{}", self.app_name, self.env_name)
        } else {
            self.deployment_app_name.clone()
        }
    }

    pub fn stage_yaml(&self, stage: StageType) -> Option<&str> {
        let yaml = match stage {
            StageType::Pre => self.pre_stage_yaml.as_deref(),
            StageType::Post => self.post_stage_yaml.as_deref(),
        };
        yaml.filter(|y| !y.trim().is_empty())
    }

    pub fn stage_trigger_type(&self, stage: StageType) -> TriggerType {
        match stage {
            StageType::Pre => self.pre_trigger_type,
            StageType::Post => self.post_trigger_type,
        }
    }

    pub fn stage_runs_in_env(&self, stage: StageType) -> bool {
        match stage {
            StageType::Pre => self.pre_runs_in_env,
            StageType::Post => self.post_runs_in_env,
        }
    }

    pub fn requires_approval(&self) -> bool {
        self.approval
            .as_ref()
            .is_some_and(|a| a.required_approvals > 0)
    }
}

/// Which side of the deployment a job stage runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageType {
    Pre,
    Post,
}

impl StageType {
    pub fn workflow_type(&self) -> WorkflowType {
        match self {
            StageType::Pre => WorkflowType::Pre,
            StageType::Post => WorkflowType::Post,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageType::Pre => "PRE",
            StageType::Post => "POST",
        }
    }
}

/// A structured pre/post stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStage {
    pub id: i64,
    pub pipeline_id: PipelineId,
    pub stage_type: StageType,
    pub steps: Vec<StageStep>,
}

impl PipelineStage {
    /// A stage without steps is left over from a broken edit and is treated as absent.
    pub fn is_corrupted(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn ref_plugins(&self) -> impl Iterator<Item = &RefPlugin> {
        self.steps.iter().filter_map(|s| match &s.kind {
            StepKind::RefPlugin(plugin) => Some(plugin),
            StepKind::Inline { .. } => None,
        })
    }

    /// The copy-container-image plugin step, if the stage uses one.
    pub fn copy_image_plugin(&self) -> Option<&RefPlugin> {
        self.ref_plugins()
            .find(|p| p.name == COPY_CONTAINER_IMAGE_PLUGIN)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStep {
    pub index: u32,
    pub name: String,
    pub kind: StepKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Inline { script: String },
    RefPlugin(RefPlugin),
}

/// A reference to a shared plugin, with its configured inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefPlugin {
    pub plugin_id: i64,
    pub name: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
}

impl RefPlugin {
    pub fn input(&self, key: &str) -> Option<&str> {
        self.inputs.get(key).map(|s| s.as_str()).filter(|s| !s.is_empty())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::pipeline;
    use super::*;

    #[test]
    fn test_release_name_defaults_to_app_env() {
        let mut p = pipeline(10);
        assert_eq!(p.app_release_name(), "payments-prod");
        p.deployment_app_name = "custom".to_string();
        assert_eq!(p.app_release_name(), "custom");
    }

    #[test]
    fn test_blank_stage_yaml_is_absent() {
        let mut p = pipeline(10);
        p.pre_stage_yaml = Some("   ".to_string());
        assert!(p.stage_yaml(StageType::Pre).is_none());
        p.pre_stage_yaml = Some("version: 0.0.1".to_string());
        assert_eq!(p.stage_yaml(StageType::Pre), Some("version: 0.0.1"));
    }

    #[test]
    fn test_copy_image_plugin_lookup() {
        let stage = PipelineStage {
            id: 1,
            pipeline_id: PipelineId(10),
            stage_type: StageType::Pre,
            steps: vec![
                StageStep {
                    index: 1,
                    name: "lint".to_string(),
                    kind: StepKind::Inline {
                        script: "make lint".to_string(),
                    },
                },
                StageStep {
                    index: 2,
                    name: "copy".to_string(),
                    kind: StepKind::RefPlugin(RefPlugin {
                        plugin_id: 7,
                        name: COPY_CONTAINER_IMAGE_PLUGIN.to_string(),
                        inputs: BTreeMap::new(),
                    }),
                },
            ],
        };
        assert!(!stage.is_corrupted());
        assert_eq!(stage.copy_image_plugin().map(|p| p.plugin_id), Some(7));
    }

    #[test]
    fn test_deployment_app_type_serde() {
        let json = serde_json::to_string(&DeploymentAppType::GitOps).unwrap();
        assert_eq!(json, "\"argo_cd\"");
        assert_eq!(
            "manifest_download".parse::<DeploymentAppType>().unwrap(),
            DeploymentAppType::ManifestDownload
        );
    }
}
