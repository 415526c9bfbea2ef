//! Shipping collaborators: Helm executor, GitOps repository, ArgoCD and
//! read access to target clusters.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Identifies a Helm release on a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelmAppIdentifier {
    pub cluster_id: i64,
    pub namespace: String,
    pub release_name: String,
}

/// Install or upgrade request for the Helm executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelmReleaseRequest {
    pub app: HelmAppIdentifier,
    pub chart_name: String,
    pub chart_version: String,
    pub values_yaml: String,
    /// Packaged chart (`.tgz`).
    #[serde(skip)]
    pub chart_content: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HelmReleaseState {
    Deployed,
    Superseded,
    Failed,
    PendingInstall,
    PendingUpgrade,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppHealth {
    Healthy,
    Progressing,
    Degraded,
    Missing,
    #[serde(other)]
    Unknown,
}

/// Release and application status as reported by the Helm executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseStatus {
    pub state: HelmReleaseState,
    #[serde(default)]
    pub description: String,
    pub last_deployed: Option<DateTime<Utc>>,
    pub app_health: Option<AppHealth>,
}

#[async_trait]
pub trait HelmClient: Send + Sync {
    /// First install of a release from a packaged chart.
    async fn install_release_with_custom_chart(&self, request: &HelmReleaseRequest) -> Result<()>;

    /// Upgrade an installed release.
    async fn update_application(&self, request: &HelmReleaseRequest) -> Result<()>;

    /// `None` when the release does not exist.
    async fn get_application_and_release_status(
        &self,
        app: &HelmAppIdentifier,
    ) -> Result<Option<ReleaseStatus>>;
}

/// Rendered values to commit into a GitOps repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValuesCommit {
    pub repo_url: String,
    pub chart_location: String,
    pub file_name: String,
    pub values_yaml: String,
    pub author_name: String,
    pub author_email: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub hash: String,
    pub time: DateTime<Utc>,
}

#[async_trait]
pub trait GitOpsClient: Send + Sync {
    async fn commit_values(&self, commit: &ValuesCommit) -> Result<CommitInfo>;
}

/// The parts of an ArgoCD application the release engine cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgoApplication {
    pub name: String,
    pub repo_url: String,
    pub target_revision: String,
    pub path: String,
    pub auto_sync: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchType {
    Merge,
    Json,
}

#[async_trait]
pub trait ArgoCdClient: Send + Sync {
    async fn get(&self, app_name: &str) -> Result<Option<ArgoApplication>>;

    async fn patch(&self, app_name: &str, patch: &serde_json::Value, patch_type: PatchType)
    -> Result<()>;

    async fn sync(&self, app_name: &str) -> Result<()>;

    /// Switch the application's sync policy to match `auto_sync`.
    ///
    /// Returns true when a patch was sent.
    async fn update_sync_mode_if_needed(&self, app: &ArgoApplication, auto_sync: bool) -> Result<bool> {
        if app.auto_sync == auto_sync {
            return Ok(false);
        }
        let automated = if auto_sync {
            serde_json::json!({ "prune": true })
        } else {
            serde_json::Value::Null
        };
        let patch = serde_json::json!({ "spec": { "syncPolicy": { "automated": automated } } });
        self.patch(&app.name, &patch, PatchType::Merge).await?;
        Ok(true)
    }
}

/// A namespaced Kubernetes object to read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// Fetch an object as JSON; `None` when it does not exist.
    async fn get_resource(
        &self,
        cluster_id: i64,
        resource: &ResourceRef,
    ) -> Result<Option<serde_json::Value>>;
}
