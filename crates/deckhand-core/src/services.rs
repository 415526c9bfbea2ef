//! Supporting services the trigger core consults but does not own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::artifact::ApprovalState;
use crate::pipeline::Pipeline;
use crate::workflow::WorkflowType;
use crate::{ArtifactId, OverrideId, PipelineId, Result, RunnerId};

/// Image scanning results and policy.
#[async_trait]
pub trait ScanService: Send + Sync {
    /// CVE names found for a digest; `None` when the digest was never scanned.
    async fn scan_result(&self, image_digest: &str) -> Result<Option<Vec<String>>>;

    /// CVE names blocked by policy for this cluster, environment and app.
    async fn blocked_cves(&self, cluster_id: i64, env_id: i64, app_id: i64) -> Result<Vec<String>>;

    /// Record that an image with this digest is now deployed to the env.
    async fn mark_image_deployed(&self, app_id: i64, env_id: i64, image_digest: &str) -> Result<()>;

    /// Forget the deployed-image record for an env.
    async fn clear_image_deployed(&self, app_id: i64, env_id: i64) -> Result<()>;
}

#[async_trait]
pub trait ApprovalService: Send + Sync {
    async fn approval_state(
        &self,
        pipeline_id: PipelineId,
        artifact_id: ArtifactId,
    ) -> Result<ApprovalState>;
}

/// Promotion details shown next to an artifact in promotion listings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionApprovalMetadata {
    pub approval_required: bool,
    pub approved_by: Vec<i64>,
    pub promoted_from: Option<String>,
    pub promoted_on: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait PromotionService: Send + Sync {
    async fn promotion_metadata(
        &self,
        pipeline_id: PipelineId,
        artifact_ids: &[ArtifactId],
    ) -> Result<BTreeMap<ArtifactId, PromotionApprovalMetadata>>;
}

/// Which pipelines a filter applies to. Empty lists match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterScope {
    #[serde(default)]
    pub app_ids: Vec<i64>,
    #[serde(default)]
    pub env_ids: Vec<i64>,
    #[serde(default)]
    pub cluster_ids: Vec<i64>,
    #[serde(default)]
    pub project_ids: Vec<i64>,
    /// `Some(true)` limits the filter to production environments.
    #[serde(default)]
    pub is_prod: Option<bool>,
}

impl FilterScope {
    pub fn matches(&self, pipeline: &Pipeline) -> bool {
        fn hit(list: &[i64], id: i64) -> bool {
            list.is_empty() || list.contains(&id)
        }
        hit(&self.app_ids, pipeline.app_id)
            && hit(&self.env_ids, pipeline.env_id)
            && hit(&self.cluster_ids, pipeline.cluster_id)
            && hit(&self.project_ids, pipeline.project_id)
            && self.is_prod.is_none_or(|prod| prod == pipeline.is_prod)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterSubject {
    Image,
    ImageTag,
    ReleaseTag,
    GitBranch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    /// Artifact must match.
    Pass,
    /// Artifact must not match.
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub kind: ConditionKind,
    pub subject: FilterSubject,
    /// Regular expression matched against the subject.
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceFilter {
    pub id: i64,
    pub name: String,
    pub scope: FilterScope,
    pub conditions: Vec<FilterCondition>,
}

#[async_trait]
pub trait FilterStore: Send + Sync {
    async fn active_filters(&self) -> Result<Vec<ResourceFilter>>;

    /// Release tags attached to an artifact.
    async fn release_tags(&self, artifact_id: ArtifactId) -> Result<Vec<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    Trigger,
    Success,
    Fail,
    Blocked,
}

/// An event for the notification sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub kind: NotificationKind,
    pub pipeline_id: PipelineId,
    pub app_id: i64,
    pub env_id: i64,
    pub runner_id: RunnerId,
    pub workflow_type: WorkflowType,
    pub triggered_by: i64,
    pub message: Option<String>,
    pub time: DateTime<Utc>,
}

/// Audit record of a shipped release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdTriggerEvent {
    pub pipeline_id: PipelineId,
    pub runner_id: RunnerId,
    pub release_counter: i64,
    pub pipeline_override_id: OverrideId,
    pub ci_artifact_id: ArtifactId,
    pub commit_hashes: Vec<String>,
    pub triggered_by: i64,
    pub triggered_at: DateTime<Utc>,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, event: NotificationEvent) -> Result<()>;

    async fn write_cd_trigger_event(&self, event: CdTriggerEvent) -> Result<()>;
}

/// The scope scoped variables are resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariableScope {
    pub app_id: i64,
    pub env_id: i64,
    pub cluster_id: i64,
    pub project_id: i64,
}

impl From<&Pipeline> for VariableScope {
    fn from(p: &Pipeline) -> Self {
        Self {
            app_id: p.app_id,
            env_id: p.env_id,
            cluster_id: p.cluster_id,
            project_id: p.project_id,
        }
    }
}

#[async_trait]
pub trait ScopedVariableResolver: Send + Sync {
    /// Values for `names` at `scope`. Unknown names are left out.
    async fn resolve(
        &self,
        scope: &VariableScope,
        names: &[String],
    ) -> Result<BTreeMap<String, String>>;
}
