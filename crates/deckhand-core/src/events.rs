//! Messaging topics and payloads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

use crate::artifact::PluginArtifacts;
use crate::release::{DeploymentType, ValuesOverrideRequest};
use crate::{ArtifactId, Error, OverrideId, PipelineId, Result, RunnerId, WorkflowId};

pub mod topics {
    pub const CI_COMPLETE: &str = "CI-COMPLETE";
    pub const CD_STAGE_COMPLETE: &str = "CD-STAGE-COMPLETE";
    pub const CD_WORKFLOW_STATUS: &str = "CD-WORKFLOW-STATUS-UPDATE";
    pub const BULK_DEPLOY: &str = "CD-BULK-DEPLOY-TRIGGER";
    pub const BULK_HIBERNATE: &str = "CD-BULK-HIBERNATE";
    pub const ASYNC_CHART_INSTALL: &str = "DEVTRON-CHART-INSTALL";
    pub const CD_PIPELINE_DELETE: &str = "CD-PIPELINE-DELETE";
    pub const CD_SUCCESS: &str = "CD-SUCCESS";
}

/// A message claimed from a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub attempts: i32,
}

impl Message {
    /// Decode the payload, rejecting anything that does not fit `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            Error::InvalidInput(format!("malformed {} payload: {}", self.topic, e))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiCompleteEvent {
    pub ci_artifact_id: ArtifactId,
    pub triggered_by: i64,
    /// Set for artifacts pushed through an external-CI webhook.
    #[serde(default)]
    pub external_ci_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdStageCompleteEvent {
    pub workflow_id: WorkflowId,
    pub workflow_runner_id: RunnerId,
    pub cd_pipeline_id: PipelineId,
    pub triggered_by: i64,
    pub ci_artifact_id: ArtifactId,
    #[serde(default)]
    pub plugin_registry_artifact_details: PluginArtifacts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsyncCdDeployEvent {
    pub values_override_request: ValuesOverrideRequest,
    pub triggered_at: DateTime<Utc>,
    pub triggered_by: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkTriggerRequest {
    pub ci_artifact_id: ArtifactId,
    pub pipeline_id: PipelineId,
    /// Workflow row created when the request was accepted.
    #[serde(default)]
    pub cd_workflow_id: Option<WorkflowId>,
    #[serde(default)]
    pub triggered_by: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentGroupAppWithEnv {
    pub app_id: i64,
    pub env_id: i64,
    pub pipeline_id: PipelineId,
    #[serde(default)]
    pub deployment_group_id: i64,
    pub user_id: i64,
    pub request_type: DeploymentType,
    #[serde(default)]
    pub cd_workflow_id: Option<WorkflowId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDeletedEvent {
    pub pipeline_id: PipelineId,
    pub deleted_by: i64,
}

/// Published after a release ships, for downstream propagation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdSuccessEvent {
    pub application_id: i64,
    pub environment_id: i64,
    pub release_id: i64,
    pub pipeline_override_id: OverrideId,
    pub trigger_time: DateTime<Utc>,
    pub ci_artifact_id: ArtifactId,
    pub pipeline_materials: Vec<String>,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a payload, returning the message id.
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<String>;
}

/// Serialize and publish.
pub async fn publish_json<T: Serialize + Sync>(
    bus: &dyn EventBus,
    topic: &str,
    payload: &T,
) -> Result<String> {
    let value = serde_json::to_value(payload)
        .map_err(|e| Error::Internal(format!("serialize {topic} payload: {e}")))?;
    bus.publish(topic, value).await
}

/// Consumer side of the bus.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Claim the next message on `topic`, if any.
    async fn claim(&self, consumer: &str, topic: &str) -> Result<Option<Message>>;

    /// Acknowledge a processed message.
    async fn complete(&self, message_id: &str) -> Result<()>;

    /// Record a failed attempt; the message becomes claimable again.
    async fn fail(&self, message_id: &str, error: &str) -> Result<()>;
}
