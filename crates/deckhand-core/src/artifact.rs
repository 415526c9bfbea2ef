//! Immutable image references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{ArtifactId, PipelineId};

/// Where an artifact came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactSource {
    CiRunner,
    PreCd,
    PostCd,
    PostCi,
    Webhook,
}

impl ArtifactSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactSource::CiRunner => "ci_runner",
            ArtifactSource::PreCd => "pre_cd",
            ArtifactSource::PostCd => "post_cd",
            ArtifactSource::PostCi => "post_ci",
            ArtifactSource::Webhook => "webhook",
        }
    }
}

impl std::str::FromStr for ArtifactSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ci_runner" | "CI-RUNNER" => ArtifactSource::CiRunner,
            "pre_cd" | "pre_cd_stage" => ArtifactSource::PreCd,
            "post_cd" | "post_cd_stage" => ArtifactSource::PostCd,
            "post_ci" => ArtifactSource::PostCi,
            "webhook" | "ext" => ArtifactSource::Webhook,
            other => return Err(format!("unknown artifact source: {other}")),
        })
    }
}

/// A built image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiArtifact {
    pub id: ArtifactId,
    /// CI pipeline that produced the artifact (or whose artifact was copied).
    pub ci_pipeline_id: Option<i64>,
    /// Plugin component id, set when the artifact was produced after CI.
    pub component_id: Option<i64>,
    /// CD pipeline whose stage produced the artifact.
    pub cd_pipeline_id: Option<PipelineId>,
    pub external_ci_id: Option<i64>,
    pub image: String,
    pub image_digest: String,
    /// Source materials (repository, branch, commit) as recorded by CI.
    pub material_info: serde_json::Value,
    pub data_source: ArtifactSource,
    pub parent_ci_artifact: Option<ArtifactId>,
    pub credentials_source: Option<String>,
    pub scan_enabled: bool,
    pub scanned: bool,
    pub created_on: DateTime<Utc>,
}

impl CiArtifact {
    /// The artifact at the root of the copy chain.
    pub fn root_id(&self) -> ArtifactId {
        self.parent_ci_artifact.unwrap_or(self.id)
    }

    /// The image tag, i.e. everything after the last `:` that is not part of a registry port.
    pub fn image_tag(&self) -> &str {
        split_image(&self.image).1
    }

    /// Commit hashes of every material, used in trigger events.
    pub fn commit_hashes(&self) -> Vec<String> {
        let materials = match &self.material_info {
            serde_json::Value::Array(items) => items.as_slice(),
            _ => return Vec::new(),
        };
        materials
            .iter()
            .filter_map(|m| {
                m.get("revision")
                    .or_else(|| m.pointer("/modifications/0/revision"))
                    .and_then(|r| r.as_str())
                    .map(|s| s.to_string())
            })
            .collect()
    }
}

/// Split `repo[:port]/name:tag` into `(repo/name, tag)`.
///
/// Images without a tag yield an empty tag.
pub fn split_image(image: &str) -> (&str, &str) {
    let last_slash = image.rfind('/').unwrap_or(0);
    match image[last_slash..].rfind(':') {
        Some(idx) => {
            let idx = last_slash + idx;
            (&image[..idx], &image[idx + 1..])
        }
        None => (image, ""),
    }
}

/// Attributes for inserting an artifact produced by a stage plugin.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub image: String,
    pub image_digest: String,
    pub material_info: serde_json::Value,
    pub data_source: ArtifactSource,
    pub cd_pipeline_id: PipelineId,
    pub parent_ci_artifact: ArtifactId,
    pub credentials_source: Option<String>,
    pub scan_enabled: bool,
    pub scanned: bool,
}

/// Images pushed by a plugin during a stage, keyed by destination registry.
pub type PluginArtifacts = BTreeMap<String, Vec<String>>;

/// Approval state of an artifact on a pipeline that requires approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    None,
    Requested,
    Approved,
    Consumed,
}
