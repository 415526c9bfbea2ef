//! Gate evaluators: vulnerability, approval, resource filters and the
//! artifact listing annotations derived from them.

use deckhand_core::artifact::{ApprovalState, CiArtifact};
use deckhand_core::pipeline::Pipeline;
use deckhand_core::services::{
    ApprovalService, ConditionKind, FilterCondition, FilterStore, FilterSubject,
    PromotionApprovalMetadata, PromotionService, ResourceFilter, ScanService,
};
use deckhand_core::{ArtifactId, Error, Result};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::deps::Collaborators;

pub const FILTER_BLOCKED_MESSAGE: &str = "the artifact does not pass filtering condition";

/// Result of evaluating every filter in scope for a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterEvaluation {
    pub allowed: bool,
    /// Filters that were in scope, whether they passed or not.
    pub filter_ids: Vec<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterState {
    Allowed,
    Blocked,
}

/// An artifact as surfaced to listing and approval screens.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactListing {
    pub artifact_id: ArtifactId,
    pub image: String,
    pub filter_state: FilterState,
    pub approval_state: ApprovalState,
    pub promotion_approval_metadata: Option<PromotionApprovalMetadata>,
}

pub struct GateEvaluator {
    scans: Arc<dyn ScanService>,
    approvals: Arc<dyn ApprovalService>,
    promotions: Arc<dyn PromotionService>,
    filters: Arc<dyn FilterStore>,
}

impl GateEvaluator {
    pub fn from_collaborators(deps: &Collaborators) -> Self {
        Self {
            scans: deps.scans.clone(),
            approvals: deps.approvals.clone(),
            promotions: deps.promotions.clone(),
            filters: deps.filters.clone(),
        }
    }

    /// Whether the artifact's scan result hits a CVE blocked for the
    /// pipeline's cluster, env and app. Artifacts without a digest or scan
    /// result pass.
    pub async fn is_vulnerable(&self, pipeline: &Pipeline, artifact: &CiArtifact) -> Result<bool> {
        if artifact.image_digest.is_empty() {
            return Ok(false);
        }
        let Some(found) = self.scans.scan_result(&artifact.image_digest).await? else {
            return Ok(false);
        };
        if found.is_empty() {
            return Ok(false);
        }
        let blocked: BTreeSet<String> = self
            .scans
            .blocked_cves(pipeline.cluster_id, pipeline.env_id, pipeline.app_id)
            .await?
            .into_iter()
            .collect();
        let hits: Vec<&String> = found.iter().filter(|cve| blocked.contains(*cve)).collect();
        if hits.is_empty() {
            return Ok(false);
        }
        info!(
            pipeline_id = %pipeline.id,
            artifact_id = %artifact.id,
            digest = %artifact.image_digest,
            cves = ?hits,
            "Blocked by vulnerability policy"
        );
        Ok(true)
    }

    /// Refuse artifacts that are not approved on pipelines with an approval node.
    pub async fn check_approval(&self, pipeline: &Pipeline, artifact_id: ArtifactId) -> Result<()> {
        if !pipeline.requires_approval() {
            return Ok(());
        }
        let state = self.approvals.approval_state(pipeline.id, artifact_id).await?;
        if state == ApprovalState::Approved {
            return Ok(());
        }
        info!(pipeline_id = %pipeline.id, artifact_id = %artifact_id, state = ?state, "Artifact not approved");
        Err(Error::Blocked(format!(
            "artifact {artifact_id} is not approved for deployment on pipeline {}",
            pipeline.id
        )))
    }

    pub async fn evaluate_filters(
        &self,
        pipeline: &Pipeline,
        artifact: &CiArtifact,
    ) -> Result<FilterEvaluation> {
        let filters = self.filters.active_filters().await?;
        let in_scope: Vec<&ResourceFilter> =
            filters.iter().filter(|f| f.scope.matches(pipeline)).collect();
        if in_scope.is_empty() {
            return Ok(FilterEvaluation {
                allowed: true,
                filter_ids: Vec::new(),
            });
        }

        let subject = FilterSubjectValues {
            image: vec![artifact.image.clone()],
            image_tag: vec![artifact.image_tag().to_string()],
            release_tags: self.filters.release_tags(artifact.id).await?,
            git_branches: git_branches(artifact),
        };
        let mut allowed = true;
        for filter in &in_scope {
            if !subject.passes(filter)? {
                debug!(filter_id = filter.id, artifact_id = %artifact.id, "Filter rejected artifact");
                allowed = false;
            }
        }
        Ok(FilterEvaluation {
            allowed,
            filter_ids: in_scope.iter().map(|f| f.id).collect(),
        })
    }

    /// Annotate artifacts with filter, approval and promotion state for a
    /// pipeline's listing.
    pub async fn annotate_artifacts(
        &self,
        pipeline: &Pipeline,
        artifacts: &[CiArtifact],
    ) -> Result<Vec<ArtifactListing>> {
        let ids: Vec<ArtifactId> = artifacts.iter().map(|a| a.id).collect();
        let mut promotions = self.promotions.promotion_metadata(pipeline.id, &ids).await?;
        let mut listing = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let evaluation = self.evaluate_filters(pipeline, artifact).await?;
            let approval_state = if pipeline.requires_approval() {
                self.approvals.approval_state(pipeline.id, artifact.id).await?
            } else {
                ApprovalState::None
            };
            listing.push(ArtifactListing {
                artifact_id: artifact.id,
                image: artifact.image.clone(),
                filter_state: if evaluation.allowed {
                    FilterState::Allowed
                } else {
                    FilterState::Blocked
                },
                approval_state,
                promotion_approval_metadata: promotions.remove(&artifact.id),
            });
        }
        Ok(listing)
    }
}

struct FilterSubjectValues {
    image: Vec<String>,
    image_tag: Vec<String>,
    release_tags: Vec<String>,
    git_branches: Vec<String>,
}

impl FilterSubjectValues {
    fn values(&self, subject: FilterSubject) -> &[String] {
        match subject {
            FilterSubject::Image => &self.image,
            FilterSubject::ImageTag => &self.image_tag,
            FilterSubject::ReleaseTag => &self.release_tags,
            FilterSubject::GitBranch => &self.git_branches,
        }
    }

    fn matches(&self, condition: &FilterCondition) -> Result<bool> {
        let regex = Regex::new(&condition.pattern).map_err(|e| {
            Error::InvalidInput(format!("invalid filter pattern {}: {e}", condition.pattern))
        })?;
        Ok(self
            .values(condition.subject)
            .iter()
            .any(|v| regex.is_match(v)))
    }

    /// Every pass condition must match and no fail condition may.
    fn passes(&self, filter: &ResourceFilter) -> Result<bool> {
        for condition in &filter.conditions {
            let hit = self.matches(condition)?;
            let ok = match condition.kind {
                ConditionKind::Pass => hit,
                ConditionKind::Fail => !hit,
            };
            if !ok {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn git_branches(artifact: &CiArtifact) -> Vec<String> {
    let serde_json::Value::Array(materials) = &artifact.material_info else {
        return Vec::new();
    };
    materials
        .iter()
        .filter_map(|m| {
            m.get("branch")
                .or_else(|| m.pointer("/source/value"))
                .and_then(|b| b.as_str())
                .map(str::to_string)
        })
        .collect()
}
