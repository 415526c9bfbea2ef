//! Executor trait and job-execution types.
//!
//! Pre and post stages run as workflows on an Argo-Workflows-shaped executor.
//! The executor reports progress back as [`WorkflowStatusEvent`]s, which are
//! validated here at the edge instead of being passed around as loose maps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::pipeline::StageType;
use crate::secret::DockerRegistry;
use crate::workflow::{ExecutorType, RunnerStatus};
use crate::{ArtifactId, Error, PipelineId, Result, RunnerId, WorkflowId};

/// Copy the source image to these destination paths after the stage runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyImageSpec {
    pub source_image: String,
    pub destinations: Vec<String>,
    pub registries: Vec<DockerRegistry>,
}

/// Deploy-stage details a post stage receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployInfo {
    pub deploy_runner_id: RunnerId,
    pub triggered_at: DateTime<Utc>,
    pub triggered_by: i64,
    pub release_counter: Option<i64>,
}

/// A request to run one pre or post stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRequest {
    /// Executor-side name of the workflow, unique per runner.
    pub name: String,
    pub runner_id: RunnerId,
    pub workflow_id: WorkflowId,
    pub pipeline_id: PipelineId,
    pub pipeline_name: String,
    pub app_id: i64,
    pub env_id: i64,
    pub cluster_id: i64,
    pub stage_type: StageType,
    pub executor_type: ExecutorType,
    pub namespace: String,
    /// Run in the target environment's cluster instead of the default one.
    pub run_in_env: bool,
    pub ci_artifact_id: ArtifactId,
    pub image: String,
    pub image_digest: String,
    /// Free-form stage definition, passed through untouched.
    pub stage_yaml: Option<String>,
    /// Structured steps with ref-plugins resolved.
    pub steps: serde_json::Value,
    pub env_vars: BTreeMap<String, String>,
    /// Scoped variables resolved at runner scope.
    pub variables: BTreeMap<String, String>,
    pub log_location: Option<String>,
    pub copy_image: Option<CopyImageSpec>,
    pub deploy_info: Option<DeployInfo>,
    pub triggered_by: i64,
}

/// Where an already-submitted workflow lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTarget {
    pub name: String,
    pub namespace: String,
    /// Set when the workflow runs in an external cluster.
    pub cluster_url: Option<String>,
    pub token: Option<String>,
    pub is_ext: bool,
}

impl WorkflowTarget {
    pub fn in_cluster(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            cluster_url: None,
            token: None,
            is_ext: false,
        }
    }
}

/// Handle returned on submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowHandle {
    pub name: String,
    pub namespace: String,
    pub executor: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
}

impl WorkflowPhase {
    pub fn runner_status(&self) -> RunnerStatus {
        match self {
            WorkflowPhase::Pending => RunnerStatus::Starting,
            WorkflowPhase::Running => RunnerStatus::InProgress,
            WorkflowPhase::Succeeded => RunnerStatus::Succeeded,
            WorkflowPhase::Failed | WorkflowPhase::Error => RunnerStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodePhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
    Skipped,
    Omitted,
}

impl NodePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodePhase::Pending => "Pending",
            NodePhase::Running => "Running",
            NodePhase::Succeeded => "Succeeded",
            NodePhase::Failed => "Failed",
            NodePhase::Error => "Error",
            NodePhase::Skipped => "Skipped",
            NodePhase::Omitted => "Omitted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowNode {
    pub template_name: String,
    pub phase: NodePhase,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub boundary_id: String,
    #[serde(default)]
    pub outputs: Option<serde_json::Value>,
}

/// A workflow status update as published by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatusEvent {
    /// Workflow name; equals the runner's executor-side name.
    pub name: String,
    pub phase: WorkflowPhase,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub nodes: BTreeMap<String, WorkflowNode>,
}

impl WorkflowStatusEvent {
    /// Parse and validate a raw status payload.
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| Error::InvalidInput(format!("invalid workflow status event: {e}")))
    }

    /// The pod node for the CD template.
    ///
    /// Nodes are keyed by pod name. An event with no node for `template_name`
    /// is rejected rather than matched against an arbitrary node.
    pub fn pod_node(&self, template_name: &str) -> Result<(&str, &WorkflowNode)> {
        self.nodes
            .iter()
            .find(|(_, node)| node.template_name == template_name)
            .map(|(id, node)| (id.as_str(), node))
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "workflow {} has no node for template {}",
                    self.name, template_name
                ))
            })
    }
}

/// A point-in-time view of a workflow fetched from the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub phase: Option<WorkflowPhase>,
    pub message: String,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Trait for stage executors.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Submit a stage for execution.
    async fn submit_workflow(&self, request: &WorkflowRequest) -> Result<WorkflowHandle>;

    /// Fetch the current state of a workflow, `None` if it no longer exists.
    async fn get_workflow(&self, target: &WorkflowTarget) -> Result<Option<WorkflowSnapshot>>;

    /// Stop a running workflow, keeping its record.
    async fn terminate_workflow(&self, target: &WorkflowTarget) -> Result<()>;

    /// Remove a workflow.
    async fn delete_workflow(&self, target: &WorkflowTarget) -> Result<()>;
}
