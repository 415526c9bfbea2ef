//! CD trigger routes: manual triggers, bulk actions and stage cancellation.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use deckhand_core::events::{BulkTriggerRequest, DeploymentGroupAppWithEnv};
use deckhand_core::release::{DeploymentType, DeploymentWithConfig, ValuesOverrideRequest};
use deckhand_core::workflow::{RunnerStatus, WorkflowType};
use deckhand_core::{ArtifactId, PipelineId, RunnerId, WorkflowId};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/trigger", post(trigger))
        .route("/bulk/deploy", post(bulk_deploy))
        .route("/bulk/hibernate", post(bulk_hibernate))
        .route("/stage/{runner_id}/cancel", post(cancel_stage))
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    pub pipeline_id: PipelineId,
    #[serde(default)]
    pub app_id: i64,
    #[serde(default)]
    pub env_id: i64,
    pub ci_artifact_id: ArtifactId,
    /// `PRE`, `DEPLOY` or `POST`.
    pub cd_workflow_type: String,
    #[serde(default)]
    pub deployment_type: DeploymentType,
    #[serde(default)]
    pub deployment_with_config: DeploymentWithConfig,
    #[serde(default)]
    pub wfr_id_for_deployment_with_specific_trigger: Option<RunnerId>,
    #[serde(default)]
    pub additional_override: Option<serde_json::Value>,
    pub triggered_by: i64,
    #[serde(default)]
    pub user_email: Option<String>,
}

impl TriggerRequest {
    fn into_values_override(self) -> Result<ValuesOverrideRequest, ApiError> {
        let workflow_type: WorkflowType = self.cd_workflow_type.parse()?;
        let mut request = ValuesOverrideRequest::new(
            self.pipeline_id,
            self.ci_artifact_id,
            workflow_type,
            self.triggered_by,
        );
        request.app_id = self.app_id;
        request.env_id = self.env_id;
        request.deployment_type = self.deployment_type;
        request.deployment_with_config = self.deployment_with_config;
        request.wfr_id_for_deployment_with_specific_trigger =
            self.wfr_id_for_deployment_with_specific_trigger;
        request.additional_override = self.additional_override;
        request.user_email = self.user_email;
        Ok(request)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse {
    /// Absent when the release continues in the background.
    pub release_counter: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub cd_workflow_ids: Vec<WorkflowId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelStageRequest {
    pub user_id: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelStageResponse {
    pub runner_id: RunnerId,
    pub status: RunnerStatus,
}

// ============================================================================
// Handlers
// ============================================================================

async fn trigger(
    State(state): State<AppState>,
    Json(body): Json<TriggerRequest>,
) -> Result<Json<TriggerResponse>, ApiError> {
    let request = body.into_values_override()?;
    let release_counter = state.orchestrator.manual_cd_trigger(request).await?;
    Ok(Json(TriggerResponse { release_counter }))
}

async fn bulk_deploy(
    State(state): State<AppState>,
    Json(requests): Json<Vec<BulkTriggerRequest>>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let cd_workflow_ids = state
        .orchestrator
        .trigger_bulk_deployment_async(requests)
        .await?;
    info!(accepted = cd_workflow_ids.len(), "Bulk deploy accepted");
    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { cd_workflow_ids })))
}

async fn bulk_hibernate(
    State(state): State<AppState>,
    Json(requests): Json<Vec<DeploymentGroupAppWithEnv>>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let cd_workflow_ids = state
        .orchestrator
        .trigger_bulk_hibernate_async(requests)
        .await?;
    info!(accepted = cd_workflow_ids.len(), "Bulk hibernate accepted");
    Ok((StatusCode::ACCEPTED, Json(AcceptedResponse { cd_workflow_ids })))
}

async fn cancel_stage(
    State(state): State<AppState>,
    Path(runner_id): Path<RunnerId>,
    Json(body): Json<CancelStageRequest>,
) -> Result<Json<CancelStageResponse>, ApiError> {
    let runner = state
        .orchestrator
        .stages()
        .cancel(runner_id, body.user_id)
        .await?;
    Ok(Json(CancelStageResponse {
        runner_id: runner.id,
        status: runner.status,
    }))
}
