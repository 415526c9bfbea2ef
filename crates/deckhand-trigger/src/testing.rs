//! In-memory collaborators shared by the trigger tests.
//!
//! [`MemoryStore`] keeps the same uniqueness rules and terminal-status
//! guards as the Postgres repositories, so the orchestration code under test
//! sees the same conflicts it would in production.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use deckhand_config::CdConfig;
use deckhand_core::artifact::{ApprovalState, ArtifactSource, CiArtifact, NewArtifact};
use deckhand_core::deployer::{
    ArgoApplication, ArgoCdClient, ClusterReader, CommitInfo, GitOpsClient, HelmAppIdentifier,
    HelmClient, HelmReleaseRequest, PatchType, ReleaseStatus, ResourceRef, ValuesCommit,
};
use deckhand_core::events::{EventBus, Message, MessageSource};
use deckhand_core::executor::{
    Executor, WorkflowHandle, WorkflowRequest, WorkflowSnapshot, WorkflowTarget,
};
use deckhand_core::history::{ConfigSnapshot, FilterAudit, StageScriptHistory};
use deckhand_core::pipeline::{
    COPY_CONTAINER_IMAGE_PLUGIN, Pipeline, PipelineStage, RefPlugin, StageType,
};
use deckhand_core::release::{
    Chart, ConfigMapSecretBundle, EnvConfigOverride, NewOverride, OverrideStatus,
    PipelineOverride, StrategyConfig, ValuesOverrideRequest,
};
use deckhand_core::secret::{DockerRegistry, RegistryCatalog, SecretString};
use deckhand_core::services::{
    ApprovalService, CdTriggerEvent, FilterStore, NotificationEvent, NotificationSink,
    PromotionApprovalMetadata, PromotionService, ResourceFilter, ScanService,
    ScopedVariableResolver, VariableScope,
};
use deckhand_core::tag::{CustomTag, ReservedImages, TagPattern};
use deckhand_core::timeline::{DESCRIPTION_REQUEST_VALIDATED, TimelineEntry, TimelineStatus};
use deckhand_core::workflow::{
    CdWorkflow, CdWorkflowRunner, ExecutorType, NewRunner, RunnerStatus, WorkflowStatus,
    WorkflowType,
};
use deckhand_core::{
    ArtifactId, Error, OverrideId, PipelineId, ReservationId, Result, RunnerId, WorkflowId,
};
use deckhand_db::{
    ArtifactRepo, ConfigRepo, CustomTagRepo, DbError, DbResult, HistoryRepo, OverrideRepo,
    PipelineRepo, StatusRepo, StatusUpdate, WorkflowRepo,
};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::coordinator::ReleaseCoordinator;
use crate::custom_tag::DESTINATION_INFO;
use crate::deps::Collaborators;
use crate::orchestrator::TriggerOrchestrator;
use crate::recorder::StatusRecorder;
use crate::release::ReleaseEngine;

/// Deployment template stored as the env override of app 1 in env 5.
pub const SNAPSHOT_TEMPLATE: &str =
    r#"{"replicaCount":"@{{replicas}}","env":{"LOG_LEVEL":"info"},"autoscaling":{"enabled":false}}"#;

pub fn pipeline(id: i64) -> Pipeline {
    use deckhand_core::pipeline::{DeploymentAppType, TriggerType};
    Pipeline {
        id: PipelineId(id),
        name: format!("cd-{id}"),
        app_id: 1,
        app_name: "payments".to_string(),
        env_id: 5,
        env_name: "prod".to_string(),
        cluster_id: 1,
        project_id: 1,
        namespace: "payments-prod".to_string(),
        is_prod: true,
        ci_pipeline_id: 3,
        parent_pipeline_id: None,
        deployment_app_type: DeploymentAppType::Helm,
        trigger_type: TriggerType::Automatic,
        pre_trigger_type: TriggerType::Automatic,
        post_trigger_type: TriggerType::Manual,
        pre_stage_yaml: None,
        post_stage_yaml: None,
        pre_runs_in_env: false,
        post_runs_in_env: false,
        deployment_app_created: false,
        deployment_app_name: String::new(),
        approval: None,
    }
}

pub fn artifact(id: i64, image: &str) -> CiArtifact {
    CiArtifact {
        id: ArtifactId(id),
        ci_pipeline_id: Some(3),
        component_id: None,
        cd_pipeline_id: None,
        external_ci_id: None,
        image: image.to_string(),
        image_digest: format!("sha256:{id}"),
        material_info: json!([{"revision": format!("rev-{id}"), "branch": "main"}]),
        data_source: ArtifactSource::CiRunner,
        parent_ci_artifact: None,
        credentials_source: None,
        scan_enabled: false,
        scanned: false,
        created_on: Utc::now(),
    }
}

pub fn chart() -> Chart {
    Chart {
        id: 1,
        app_id: 1,
        chart_ref_id: 1,
        chart_name: "payments".to_string(),
        chart_version: "4.18.1".to_string(),
        image_descriptor_template: r#"{"image":{"repository":"{{.Name}}","tag":"{{.Tag}}"},"releaseVersion":"{{.ReleaseVersion}}","pipelineName":"{{.PipelineName}}"}"#.to_string(),
        global_override: json!({}),
        chart_location: "payments/4.18.1".to_string(),
        git_repo_url: "https://github.com/acme/gitops".to_string(),
        is_app_metrics_enabled: false,
        is_custom_chart: false,
    }
}

pub fn copy_image_plugin(destination_info: &str) -> RefPlugin {
    RefPlugin {
        plugin_id: 1,
        name: COPY_CONTAINER_IMAGE_PLUGIN.to_string(),
        inputs: BTreeMap::from([(DESTINATION_INFO.to_string(), destination_info.to_string())]),
    }
}

fn missing(what: String) -> DbError {
    DbError::NotFound(what)
}

#[derive(Default)]
struct Reservation {
    path: String,
    active: bool,
}

#[derive(Default)]
struct StoreState {
    pipelines: BTreeMap<PipelineId, Pipeline>,
    external_ci: HashMap<i64, Vec<PipelineId>>,
    stages: Vec<PipelineStage>,
    deleted_stages: BTreeSet<i64>,
    artifacts: BTreeMap<ArtifactId, CiArtifact>,
    next_artifact: i64,
    workflows: BTreeMap<WorkflowId, CdWorkflow>,
    runners: BTreeMap<RunnerId, CdWorkflowRunner>,
    timelines: HashMap<RunnerId, Vec<TimelineEntry>>,
    overrides: BTreeMap<OverrideId, PipelineOverride>,
    stale_reads: HashMap<PipelineId, u32>,
    charts: Vec<Chart>,
    env_overrides: Vec<EnvConfigOverride>,
    snapshots: HashMap<RunnerId, ConfigSnapshot>,
    stage_histories: HashMap<RunnerId, StageScriptHistory>,
    filter_audits: HashMap<RunnerId, FilterAudit>,
    custom_tags: Vec<CustomTag>,
    reservations: BTreeMap<ReservationId, Reservation>,
}

impl StoreState {
    fn path_in_use(&self, path: &str) -> bool {
        self.reservations
            .values()
            .any(|r| r.active && r.path == path)
    }

    fn reserve(&mut self, paths: &[String]) -> DbResult<Vec<ReservationId>> {
        if let Some(taken) = paths.iter().find(|p| self.path_in_use(p)) {
            return Err(DbError::Duplicate(taken.clone()));
        }
        let mut ids = Vec::with_capacity(paths.len());
        for path in paths {
            let id = ReservationId(self.reservations.len() as i64 + 1);
            self.reservations.insert(
                id,
                Reservation {
                    path: path.clone(),
                    active: true,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    fn timeline_closed(&self, runner: RunnerId) -> bool {
        self.timelines
            .get(&runner)
            .is_some_and(|entries| entries.iter().any(|e| e.status.is_terminal()))
    }

    fn push_timeline(&mut self, entry: &TimelineEntry) -> bool {
        if self.timeline_closed(entry.runner_id) {
            return false;
        }
        self.timelines
            .entry(entry.runner_id)
            .or_default()
            .push(entry.clone());
        true
    }

    fn runners_of(&self, pipeline_id: PipelineId, deploy: bool) -> Vec<CdWorkflowRunner> {
        self.runners
            .values()
            .filter(|r| r.pipeline_id == pipeline_id)
            .filter(|r| (r.workflow_type == WorkflowType::Deploy) == deploy)
            .cloned()
            .collect()
    }
}

/// Every repository the trigger core reads and writes, in memory.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    fn state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap()
    }

    pub fn put_pipeline(&self, pipeline: Pipeline) {
        self.state().pipelines.insert(pipeline.id, pipeline);
    }

    pub fn pipeline(&self, id: PipelineId) -> Pipeline {
        self.state().pipelines[&id].clone()
    }

    pub fn set_app_created(&self, id: PipelineId) {
        if let Some(p) = self.state().pipelines.get_mut(&id) {
            p.deployment_app_created = true;
        }
    }

    pub fn map_external_ci(&self, external_ci_id: i64, pipeline_id: PipelineId) {
        self.state()
            .external_ci
            .entry(external_ci_id)
            .or_default()
            .push(pipeline_id);
    }

    pub fn put_stage(&self, stage: PipelineStage) {
        let mut state = self.state();
        state
            .stages
            .retain(|s| !(s.pipeline_id == stage.pipeline_id && s.stage_type == stage.stage_type));
        state.stages.push(stage);
    }

    pub fn stage_deleted(&self, stage_id: i64) -> bool {
        self.state().deleted_stages.contains(&stage_id)
    }

    pub fn put_artifact(&self, artifact: CiArtifact) {
        self.state().artifacts.insert(artifact.id, artifact);
    }

    pub fn put_chart(&self, chart: Chart) {
        self.state().charts.push(chart);
    }

    pub fn put_env_override(&self, env_override: EnvConfigOverride) {
        self.state().env_overrides.push(env_override);
    }

    pub fn update_env_override_values(&self, values: Value) {
        for o in self.state().env_overrides.iter_mut().filter(|o| o.latest) {
            o.env_override_values = values.clone();
        }
    }

    pub fn workflow(&self, id: WorkflowId) -> CdWorkflow {
        self.state().workflows[&id].clone()
    }

    pub fn runner(&self, id: RunnerId) -> CdWorkflowRunner {
        self.state().runners[&id].clone()
    }

    pub fn deploy_runners(&self, pipeline_id: PipelineId) -> Vec<CdWorkflowRunner> {
        self.state().runners_of(pipeline_id, true)
    }

    pub fn stage_runners(&self, pipeline_id: PipelineId) -> Vec<CdWorkflowRunner> {
        self.state().runners_of(pipeline_id, false)
    }

    /// Mark a runner succeeded without going through the recorder.
    pub fn complete_runner(&self, id: RunnerId) {
        if let Some(r) = self.state().runners.get_mut(&id) {
            r.status = RunnerStatus::Succeeded;
            r.finished_on = Some(Utc::now());
        }
    }

    pub fn timeline(&self, runner: RunnerId) -> Vec<TimelineEntry> {
        self.state()
            .timelines
            .get(&runner)
            .cloned()
            .unwrap_or_default()
    }

    pub fn override_for(&self, runner: RunnerId) -> Option<PipelineOverride> {
        let state = self.state();
        let workflow = state.runners.get(&runner)?.workflow_id;
        state
            .overrides
            .values()
            .find(|o| o.cd_workflow_id == workflow)
            .cloned()
    }

    /// Make the next `reads` counter lookups for the pipeline miss the latest
    /// release, as a concurrent reader would.
    pub fn stale_max_release_counter(&self, pipeline_id: PipelineId, reads: u32) {
        self.state().stale_reads.insert(pipeline_id, reads);
    }

    pub fn snapshot_of(&self, runner: RunnerId) -> Option<ConfigSnapshot> {
        self.state().snapshots.get(&runner).cloned()
    }

    pub fn stage_history(&self, runner: RunnerId) -> Option<StageScriptHistory> {
        self.state().stage_histories.get(&runner).cloned()
    }

    pub fn filter_audit(&self, runner: RunnerId) -> Option<FilterAudit> {
        self.state().filter_audits.get(&runner).cloned()
    }

    pub fn add_custom_tag(&self, entity_key: i64, entity_value: &str, pattern: &str, counter: i64) {
        let mut state = self.state();
        let id = state.custom_tags.len() as i64 + 1;
        state.custom_tags.push(CustomTag {
            id,
            entity_key,
            entity_value: entity_value.to_string(),
            tag_pattern: pattern.to_string(),
            auto_increasing_number: counter,
            enabled: true,
        });
    }

    pub fn custom_tag_counter(&self, entity_key: i64, entity_value: &str) -> Option<i64> {
        self.state()
            .custom_tags
            .iter()
            .find(|t| t.entity_key == entity_key && t.entity_value == entity_value)
            .map(|t| t.auto_increasing_number)
    }

    pub fn reserve_existing(&self, path: &str) {
        self.state().reserve(&[path.to_string()]).unwrap();
    }

    pub fn path_reserved(&self, path: &str) -> bool {
        self.state().path_in_use(path)
    }
}

#[async_trait]
impl PipelineRepo for MemoryStore {
    async fn get(&self, id: PipelineId) -> DbResult<Pipeline> {
        self.state()
            .pipelines
            .get(&id)
            .cloned()
            .ok_or_else(|| missing(format!("cd pipeline {id}")))
    }

    async fn find_by_ci_pipeline(&self, ci_pipeline_id: i64) -> DbResult<Vec<Pipeline>> {
        Ok(self
            .state()
            .pipelines
            .values()
            .filter(|p| p.ci_pipeline_id == ci_pipeline_id)
            .cloned()
            .collect())
    }

    async fn find_by_external_ci(&self, external_ci_id: i64) -> DbResult<Vec<Pipeline>> {
        let state = self.state();
        let ids = state.external_ci.get(&external_ci_id).cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(|id| state.pipelines.get(id).cloned())
            .collect())
    }

    async fn find_children(&self, parent: PipelineId) -> DbResult<Vec<Pipeline>> {
        Ok(self
            .state()
            .pipelines
            .values()
            .filter(|p| p.parent_pipeline_id == Some(parent))
            .cloned()
            .collect())
    }

    async fn set_deployment_app_created(&self, id: PipelineId, created: bool) -> DbResult<()> {
        let mut state = self.state();
        let p = state
            .pipelines
            .get_mut(&id)
            .ok_or_else(|| missing(format!("cd pipeline {id}")))?;
        p.deployment_app_created = created;
        Ok(())
    }

    async fn get_stage(&self, id: PipelineId, stage: StageType) -> DbResult<Option<PipelineStage>> {
        Ok(self
            .state()
            .stages
            .iter()
            .find(|s| s.pipeline_id == id && s.stage_type == stage)
            .cloned())
    }

    async fn delete_stage(&self, stage_id: i64) -> DbResult<()> {
        let mut state = self.state();
        state.stages.retain(|s| s.id != stage_id);
        state.deleted_stages.insert(stage_id);
        Ok(())
    }
}

#[async_trait]
impl ArtifactRepo for MemoryStore {
    async fn get(&self, id: ArtifactId) -> DbResult<CiArtifact> {
        self.state()
            .artifacts
            .get(&id)
            .cloned()
            .ok_or_else(|| missing(format!("artifact {id}")))
    }

    async fn find_by_images(
        &self,
        cd_pipeline_id: PipelineId,
        images: &[String],
    ) -> DbResult<Vec<CiArtifact>> {
        Ok(self
            .state()
            .artifacts
            .values()
            .filter(|a| a.cd_pipeline_id == Some(cd_pipeline_id) && images.contains(&a.image))
            .cloned()
            .collect())
    }

    async fn find_by_image_paths(&self, images: &[String]) -> DbResult<Vec<CiArtifact>> {
        Ok(self
            .state()
            .artifacts
            .values()
            .filter(|a| images.contains(&a.image))
            .cloned()
            .collect())
    }

    async fn create_many(&self, artifacts: &[NewArtifact]) -> DbResult<Vec<CiArtifact>> {
        let mut state = self.state();
        let mut created = Vec::with_capacity(artifacts.len());
        for new in artifacts {
            state.next_artifact += 1;
            let artifact = CiArtifact {
                id: ArtifactId(1000 + state.next_artifact),
                ci_pipeline_id: None,
                component_id: None,
                cd_pipeline_id: Some(new.cd_pipeline_id),
                external_ci_id: None,
                image: new.image.clone(),
                image_digest: new.image_digest.clone(),
                material_info: new.material_info.clone(),
                data_source: new.data_source,
                parent_ci_artifact: Some(new.parent_ci_artifact),
                credentials_source: new.credentials_source.clone(),
                scan_enabled: new.scan_enabled,
                scanned: new.scanned,
                created_on: Utc::now(),
            };
            state.artifacts.insert(artifact.id, artifact.clone());
            created.push(artifact);
        }
        Ok(created)
    }
}

#[async_trait]
impl WorkflowRepo for MemoryStore {
    async fn create_workflow(
        &self,
        pipeline_id: PipelineId,
        artifact_id: ArtifactId,
        status: Option<WorkflowStatus>,
    ) -> DbResult<CdWorkflow> {
        let mut state = self.state();
        let workflow = CdWorkflow {
            id: WorkflowId(state.workflows.len() as i64 + 1),
            pipeline_id,
            ci_artifact_id: artifact_id,
            workflow_status: status,
            created_on: Utc::now(),
        };
        state.workflows.insert(workflow.id, workflow.clone());
        Ok(workflow)
    }

    async fn get_workflow(&self, id: WorkflowId) -> DbResult<CdWorkflow> {
        self.state()
            .workflows
            .get(&id)
            .cloned()
            .ok_or_else(|| missing(format!("cd workflow {id}")))
    }

    async fn update_workflow_status(&self, id: WorkflowId, status: WorkflowStatus) -> DbResult<()> {
        if let Some(w) = self.state().workflows.get_mut(&id) {
            w.workflow_status = Some(status);
        }
        Ok(())
    }

    async fn latest_workflow_id(&self, pipeline_id: PipelineId) -> DbResult<Option<WorkflowId>> {
        Ok(self
            .state()
            .workflows
            .values()
            .filter(|w| w.pipeline_id == pipeline_id)
            .filter(|w| w.workflow_status != Some(WorkflowStatus::DroppedStale))
            .map(|w| w.id)
            .max())
    }

    async fn create_runner(&self, runner: NewRunner) -> DbResult<CdWorkflowRunner> {
        let mut state = self.state();
        let clash = state.runners.values().any(|r| {
            (r.workflow_id == runner.workflow_id && r.workflow_type == runner.workflow_type)
                || (runner.reference_id.is_some() && r.reference_id == runner.reference_id)
        });
        if clash {
            return Err(DbError::Duplicate(format!(
                "{} runner for workflow {}",
                runner.workflow_type, runner.workflow_id
            )));
        }
        let created = CdWorkflowRunner {
            id: RunnerId(state.runners.len() as i64 + 1),
            workflow_id: runner.workflow_id,
            pipeline_id: runner.pipeline_id,
            workflow_type: runner.workflow_type,
            executor_type: runner.executor_type,
            name: runner.name,
            status: runner.status,
            message: String::new(),
            pod_status: None,
            pod_name: None,
            triggered_by: runner.triggered_by,
            started_on: runner.started_on,
            finished_on: None,
            namespace: runner.namespace,
            log_location: runner.log_location,
            image_path_reservation_ids: Vec::new(),
            ref_runner_id: runner.ref_runner_id,
            reference_id: runner.reference_id,
        };
        state.runners.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_runner(&self, id: RunnerId) -> DbResult<CdWorkflowRunner> {
        self.state()
            .runners
            .get(&id)
            .cloned()
            .ok_or_else(|| missing(format!("workflow runner {id}")))
    }

    async fn find_runner(
        &self,
        workflow_id: WorkflowId,
        workflow_type: WorkflowType,
    ) -> DbResult<Option<CdWorkflowRunner>> {
        Ok(self
            .state()
            .runners
            .values()
            .find(|r| r.workflow_id == workflow_id && r.workflow_type == workflow_type)
            .cloned())
    }

    async fn find_runner_by_reference(
        &self,
        reference_id: &str,
    ) -> DbResult<Option<CdWorkflowRunner>> {
        Ok(self
            .state()
            .runners
            .values()
            .find(|r| r.reference_id.as_deref() == Some(reference_id))
            .cloned())
    }

    async fn find_runner_by_name(&self, name: &str) -> DbResult<Option<CdWorkflowRunner>> {
        Ok(self
            .state()
            .runners
            .values()
            .rev()
            .find(|r| r.name == name)
            .cloned())
    }

    async fn latest_deploy_runner(
        &self,
        pipeline_id: PipelineId,
    ) -> DbResult<Option<CdWorkflowRunner>> {
        Ok(self.state().runners_of(pipeline_id, true).pop())
    }

    async fn non_terminal_deploy_runners(
        &self,
        pipeline_id: PipelineId,
        before: RunnerId,
    ) -> DbResult<Vec<CdWorkflowRunner>> {
        Ok(self
            .state()
            .runners_of(pipeline_id, true)
            .into_iter()
            .filter(|r| r.id < before && !r.status.is_terminal())
            .collect())
    }

    async fn deploy_runners_in(&self, statuses: &[RunnerStatus]) -> DbResult<Vec<CdWorkflowRunner>> {
        Ok(self
            .state()
            .runners
            .values()
            .filter(|r| r.workflow_type == WorkflowType::Deploy && statuses.contains(&r.status))
            .cloned()
            .collect())
    }

    async fn update_runner_details(&self, runner: &CdWorkflowRunner) -> DbResult<()> {
        let mut state = self.state();
        let stored = state
            .runners
            .get_mut(&runner.id)
            .ok_or_else(|| missing(format!("workflow runner {}", runner.id)))?;
        stored.namespace = runner.namespace.clone();
        stored.log_location = runner.log_location.clone();
        stored.pod_name = runner.pod_name.clone();
        stored.image_path_reservation_ids = runner.image_path_reservation_ids.clone();
        Ok(())
    }
}

#[async_trait]
impl StatusRepo for MemoryStore {
    async fn save_statuses(&self, updates: &[StatusUpdate]) -> DbResult<Vec<bool>> {
        let mut state = self.state();
        let mut applied = Vec::with_capacity(updates.len());
        for update in updates {
            let r = &update.runner;
            let written = match state.runners.get_mut(&r.id) {
                Some(stored) if !stored.status.is_terminal() => {
                    stored.status = r.status;
                    stored.message = r.message.clone();
                    stored.pod_status = r.pod_status.clone();
                    stored.pod_name = r.pod_name.clone();
                    stored.finished_on = r.finished_on;
                    true
                }
                _ => false,
            };
            if let (true, Some(entry)) = (written, &update.timeline) {
                state.push_timeline(entry);
            }
            applied.push(written);
        }
        Ok(applied)
    }

    async fn append_timeline(&self, entry: &TimelineEntry) -> DbResult<bool> {
        Ok(self.state().push_timeline(entry))
    }

    async fn timelines(&self, runner_id: RunnerId) -> DbResult<Vec<TimelineEntry>> {
        Ok(self.timeline(runner_id))
    }
}

#[async_trait]
impl OverrideRepo for MemoryStore {
    async fn max_release_counter(&self, pipeline_id: PipelineId) -> DbResult<i64> {
        let mut state = self.state();
        let max = state
            .overrides
            .values()
            .filter(|o| o.pipeline_id == pipeline_id)
            .map(|o| o.pipeline_release_counter)
            .max()
            .unwrap_or(0);
        match state.stale_reads.get_mut(&pipeline_id) {
            Some(reads) if *reads > 0 => {
                *reads -= 1;
                Ok((max - 1).max(0))
            }
            _ => Ok(max),
        }
    }

    async fn create(&self, new: &NewOverride) -> DbResult<PipelineOverride> {
        let mut state = self.state();
        let taken = state.overrides.values().any(|o| {
            o.pipeline_id == new.pipeline_id
                && o.pipeline_release_counter == new.pipeline_release_counter
        });
        if taken {
            return Err(DbError::Duplicate(format!(
                "release counter {} for pipeline {}",
                new.pipeline_release_counter, new.pipeline_id
            )));
        }
        let created = PipelineOverride {
            id: OverrideId(state.overrides.len() as i64 + 1),
            pipeline_id: new.pipeline_id,
            ci_artifact_id: new.ci_artifact_id,
            cd_workflow_id: new.cd_workflow_id,
            env_config_override_id: new.env_config_override_id,
            pipeline_release_counter: new.pipeline_release_counter,
            git_hash: None,
            commit_time: None,
            merged_values: json!({}),
            release_override_values: json!({}),
            deployment_type: new.deployment_type,
            status: OverrideStatus::New,
            created_by: new.created_by,
            created_on: Utc::now(),
        };
        state.overrides.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get(&self, id: OverrideId) -> DbResult<PipelineOverride> {
        self.state()
            .overrides
            .get(&id)
            .cloned()
            .ok_or_else(|| missing(format!("pipeline override {id}")))
    }

    async fn find_by_workflow(&self, workflow_id: WorkflowId) -> DbResult<Option<PipelineOverride>> {
        Ok(self
            .state()
            .overrides
            .values()
            .find(|o| o.cd_workflow_id == workflow_id)
            .cloned())
    }

    async fn update_counter(&self, id: OverrideId, counter: i64) -> DbResult<()> {
        if let Some(o) = self.state().overrides.get_mut(&id) {
            o.pipeline_release_counter = counter;
        }
        Ok(())
    }

    async fn save_values(
        &self,
        id: OverrideId,
        merged_values: &Value,
        release_override_values: &Value,
    ) -> DbResult<()> {
        let mut state = self.state();
        let o = state
            .overrides
            .get_mut(&id)
            .ok_or_else(|| missing(format!("pipeline override {id}")))?;
        o.merged_values = merged_values.clone();
        o.release_override_values = release_override_values.clone();
        Ok(())
    }

    async fn save_commit(&self, id: OverrideId, commit: &CommitInfo) -> DbResult<()> {
        if let Some(o) = self.state().overrides.get_mut(&id) {
            o.git_hash = Some(commit.hash.clone());
            o.commit_time = Some(commit.time);
        }
        Ok(())
    }

    async fn mark_success(&self, id: OverrideId) -> DbResult<()> {
        if let Some(o) = self.state().overrides.get_mut(&id) {
            o.status = OverrideStatus::Success;
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigRepo for MemoryStore {
    async fn chart(&self, app_id: i64) -> DbResult<Chart> {
        self.state()
            .charts
            .iter()
            .find(|c| c.app_id == app_id)
            .cloned()
            .ok_or_else(|| missing(format!("chart of app {app_id}")))
    }

    async fn chart_by_id(&self, chart_id: i64) -> DbResult<Chart> {
        self.state()
            .charts
            .iter()
            .find(|c| c.id == chart_id)
            .cloned()
            .ok_or_else(|| missing(format!("chart {chart_id}")))
    }

    async fn active_env_override(
        &self,
        chart_id: i64,
        env_id: i64,
    ) -> DbResult<Option<EnvConfigOverride>> {
        Ok(self
            .state()
            .env_overrides
            .iter()
            .find(|o| o.chart_id == chart_id && o.target_environment == env_id && o.latest)
            .cloned())
    }

    async fn create_env_override(
        &self,
        chart: &Chart,
        env_id: i64,
        _created_by: i64,
    ) -> DbResult<EnvConfigOverride> {
        let mut state = self.state();
        let created = EnvConfigOverride {
            id: state.env_overrides.len() as i64 + 1,
            chart_id: chart.id,
            target_environment: env_id,
            env_override_values: json!({}),
            is_override: false,
            is_app_metrics_enabled: None,
            latest: true,
        };
        state.env_overrides.push(created.clone());
        Ok(created)
    }

    async fn strategy(&self, _pipeline_id: PipelineId) -> DbResult<Option<StrategyConfig>> {
        Ok(None)
    }

    async fn config_maps_secrets(
        &self,
        _app_id: i64,
        _env_id: i64,
    ) -> DbResult<ConfigMapSecretBundle> {
        Ok(ConfigMapSecretBundle::default())
    }

    async fn app_labels(&self, _app_id: i64) -> DbResult<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }

    async fn db_migration_override(&self, _pipeline_id: PipelineId) -> DbResult<Option<Value>> {
        Ok(None)
    }

    async fn chart_content(&self, _chart_ref_id: i64) -> DbResult<Bytes> {
        Ok(Bytes::from_static(b"chart"))
    }
}

#[async_trait]
impl HistoryRepo for MemoryStore {
    async fn save_snapshot(&self, runner_id: RunnerId, snapshot: &ConfigSnapshot) -> DbResult<()> {
        self.state().snapshots.insert(runner_id, snapshot.clone());
        Ok(())
    }

    async fn snapshot(&self, runner_id: RunnerId) -> DbResult<Option<ConfigSnapshot>> {
        Ok(self.snapshot_of(runner_id))
    }

    async fn save_stage_history(&self, history: &StageScriptHistory) -> DbResult<()> {
        self.state()
            .stage_histories
            .insert(history.runner_id, history.clone());
        Ok(())
    }

    async fn save_filter_audit(&self, audit: &FilterAudit) -> DbResult<()> {
        self.state().filter_audits.insert(audit.runner_id, audit.clone());
        Ok(())
    }
}

#[async_trait]
impl CustomTagRepo for MemoryStore {
    async fn get(&self, entity_key: i64, entity_value: &str) -> DbResult<Option<CustomTag>> {
        Ok(self
            .state()
            .custom_tags
            .iter()
            .find(|t| t.entity_key == entity_key && t.entity_value == entity_value)
            .cloned())
    }

    async fn reserve_next_tag(
        &self,
        entity_key: i64,
        entity_value: &str,
        repositories: &[String],
    ) -> DbResult<ReservedImages> {
        let mut state = self.state();
        let index = state
            .custom_tags
            .iter()
            .position(|t| t.entity_key == entity_key && t.entity_value == entity_value)
            .ok_or_else(|| missing(format!("custom tag for entity {entity_key}/{entity_value}")))?;
        let record = &state.custom_tags[index];
        let tag = TagPattern::parse(&record.tag_pattern)
            .and_then(|p| p.render(record.auto_increasing_number))
            .map_err(|e| DbError::Rejected(e.to_string()))?;
        let paths: Vec<String> = repositories
            .iter()
            .map(|repo| format!("{}:{}", repo.trim_end_matches('/'), tag))
            .collect();
        let reservation_ids = state.reserve(&paths)?;
        state.custom_tags[index].auto_increasing_number += 1;
        Ok(ReservedImages {
            tag,
            paths,
            reservation_ids,
        })
    }

    async fn reserve_paths(&self, paths: &[String]) -> DbResult<Vec<ReservationId>> {
        self.state().reserve(paths)
    }

    async fn deactivate(&self, ids: &[ReservationId]) -> DbResult<()> {
        let mut state = self.state();
        for id in ids {
            if let Some(r) = state.reservations.get_mut(id) {
                r.active = false;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct ServiceState {
    scans: HashMap<String, Vec<String>>,
    blocked: HashMap<i64, Vec<String>>,
    approved: BTreeSet<(PipelineId, ArtifactId)>,
    filters: Vec<ResourceFilter>,
    release_tags: HashMap<ArtifactId, Vec<String>>,
    registries: HashMap<String, DockerRegistry>,
    pull_secrets: HashMap<(String, i64), String>,
    variables: BTreeMap<String, String>,
    notifications: Vec<NotificationEvent>,
    trigger_events: Vec<CdTriggerEvent>,
}

/// Scanning, approval, filter, registry, notification and variable services.
#[derive(Default)]
pub struct FakeServices {
    state: Mutex<ServiceState>,
}

impl FakeServices {
    fn state(&self) -> std::sync::MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap()
    }

    /// Block a CVE in every cluster and app of an environment.
    pub fn block_cve(&self, env_id: i64, cve: &str) {
        self.state()
            .blocked
            .entry(env_id)
            .or_default()
            .push(cve.to_string());
    }

    pub fn scan(&self, digest: &str, cves: &[&str]) {
        self.state()
            .scans
            .insert(digest.to_string(), cves.iter().map(|c| c.to_string()).collect());
    }

    pub fn approve(&self, pipeline_id: PipelineId, artifact_id: ArtifactId) {
        self.state().approved.insert((pipeline_id, artifact_id));
    }

    pub fn add_filter(&self, filter: ResourceFilter) {
        self.state().filters.push(filter);
    }

    pub fn release_tag(&self, artifact_id: ArtifactId, tag: &str) {
        self.state()
            .release_tags
            .entry(artifact_id)
            .or_default()
            .push(tag.to_string());
    }

    pub fn add_registry(&self, registry: DockerRegistry) {
        self.state().registries.insert(registry.id.clone(), registry);
    }

    pub fn pull_secret(&self, registry_id: &str, env_id: i64, name: &str) {
        self.state()
            .pull_secrets
            .insert((registry_id.to_string(), env_id), name.to_string());
    }

    pub fn set_variable(&self, name: &str, value: &str) {
        self.state()
            .variables
            .insert(name.to_string(), value.to_string());
    }

    pub fn notifications(&self) -> Vec<NotificationEvent> {
        self.state().notifications.clone()
    }

    pub fn trigger_events(&self) -> Vec<CdTriggerEvent> {
        self.state().trigger_events.clone()
    }
}

#[async_trait]
impl ScanService for FakeServices {
    async fn scan_result(&self, image_digest: &str) -> Result<Option<Vec<String>>> {
        Ok(self.state().scans.get(image_digest).cloned())
    }

    async fn blocked_cves(&self, _cluster_id: i64, env_id: i64, _app_id: i64) -> Result<Vec<String>> {
        Ok(self.state().blocked.get(&env_id).cloned().unwrap_or_default())
    }

    async fn mark_image_deployed(&self, _app_id: i64, _env_id: i64, _image_digest: &str) -> Result<()> {
        Ok(())
    }

    async fn clear_image_deployed(&self, _app_id: i64, _env_id: i64) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ApprovalService for FakeServices {
    async fn approval_state(
        &self,
        pipeline_id: PipelineId,
        artifact_id: ArtifactId,
    ) -> Result<ApprovalState> {
        if self.state().approved.contains(&(pipeline_id, artifact_id)) {
            Ok(ApprovalState::Approved)
        } else {
            Ok(ApprovalState::None)
        }
    }
}

#[async_trait]
impl PromotionService for FakeServices {
    async fn promotion_metadata(
        &self,
        _pipeline_id: PipelineId,
        _artifact_ids: &[ArtifactId],
    ) -> Result<BTreeMap<ArtifactId, PromotionApprovalMetadata>> {
        Ok(BTreeMap::new())
    }
}

#[async_trait]
impl FilterStore for FakeServices {
    async fn active_filters(&self) -> Result<Vec<ResourceFilter>> {
        Ok(self.state().filters.clone())
    }

    async fn release_tags(&self, artifact_id: ArtifactId) -> Result<Vec<String>> {
        Ok(self
            .state()
            .release_tags
            .get(&artifact_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl RegistryCatalog for FakeServices {
    async fn get(&self, registry_id: &str) -> Result<DockerRegistry> {
        self.state()
            .registries
            .get(registry_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("docker registry {registry_id}")))
    }

    async fn image_pull_secret(&self, registry_id: &str, env_id: i64) -> Result<Option<String>> {
        Ok(self
            .state()
            .pull_secrets
            .get(&(registry_id.to_string(), env_id))
            .cloned())
    }
}

#[async_trait]
impl NotificationSink for FakeServices {
    async fn send(&self, event: NotificationEvent) -> Result<()> {
        self.state().notifications.push(event);
        Ok(())
    }

    async fn write_cd_trigger_event(&self, event: CdTriggerEvent) -> Result<()> {
        self.state().trigger_events.push(event);
        Ok(())
    }
}

#[async_trait]
impl ScopedVariableResolver for FakeServices {
    async fn resolve(
        &self,
        _scope: &VariableScope,
        names: &[String],
    ) -> Result<BTreeMap<String, String>> {
        let state = self.state();
        Ok(names
            .iter()
            .filter_map(|n| state.variables.get(n).map(|v| (n.clone(), v.clone())))
            .collect())
    }
}

type Failure = Box<dyn Fn() -> Error + Send + Sync>;

/// Helm executor that records requests. Installs can be held open, delayed
/// or failed to exercise the coordinator.
#[derive(Default)]
pub struct FakeHelm {
    installs: Mutex<Vec<HelmReleaseRequest>>,
    upgrades: Mutex<Vec<HelmReleaseRequest>>,
    failure: Mutex<Option<Failure>>,
    delay: Mutex<Option<Duration>>,
    status: Mutex<Option<ReleaseStatus>>,
    hold_next: AtomicBool,
    started: AtomicBool,
    held: tokio::sync::Notify,
}

impl FakeHelm {
    pub fn installs(&self) -> Vec<HelmReleaseRequest> {
        self.installs.lock().unwrap().clone()
    }

    pub fn upgrades(&self) -> Vec<HelmReleaseRequest> {
        self.upgrades.lock().unwrap().clone()
    }

    pub fn fail_with(&self, failure: impl Fn() -> Error + Send + Sync + 'static) {
        *self.failure.lock().unwrap() = Some(Box::new(failure));
    }

    /// The next install blocks until [`FakeHelm::release_install`] or cancellation.
    pub fn hold_next_install(&self) {
        self.hold_next.store(true, Ordering::SeqCst);
    }

    pub fn release_install(&self) {
        self.held.notify_one();
    }

    pub fn install_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn set_status(&self, status: Option<ReleaseStatus>) {
        *self.status.lock().unwrap() = status;
    }

    async fn apply(&self) -> Result<()> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failure.lock().unwrap().as_ref().map(|f| f());
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl HelmClient for FakeHelm {
    async fn install_release_with_custom_chart(&self, request: &HelmReleaseRequest) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        if self.hold_next.swap(false, Ordering::SeqCst) {
            self.held.notified().await;
        }
        self.apply().await?;
        self.installs.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn update_application(&self, request: &HelmReleaseRequest) -> Result<()> {
        self.apply().await?;
        self.upgrades.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn get_application_and_release_status(
        &self,
        _app: &HelmAppIdentifier,
    ) -> Result<Option<ReleaseStatus>> {
        Ok(self.status.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeGitOps {
    commits: Mutex<Vec<ValuesCommit>>,
}

impl FakeGitOps {
    pub fn commits(&self) -> Vec<ValuesCommit> {
        self.commits.lock().unwrap().clone()
    }
}

#[async_trait]
impl GitOpsClient for FakeGitOps {
    async fn commit_values(&self, commit: &ValuesCommit) -> Result<CommitInfo> {
        let mut commits = self.commits.lock().unwrap();
        commits.push(commit.clone());
        Ok(CommitInfo {
            hash: format!("commit-{}", commits.len()),
            time: Utc::now(),
        })
    }
}

#[derive(Default)]
pub struct FakeArgo {
    apps: Mutex<HashMap<String, ArgoApplication>>,
    patches: Mutex<Vec<(String, Value)>>,
    syncs: Mutex<Vec<String>>,
}

impl FakeArgo {
    pub fn put_app(&self, name: &str, repo_url: &str, path: &str) {
        self.apps.lock().unwrap().insert(
            name.to_string(),
            ArgoApplication {
                name: name.to_string(),
                repo_url: repo_url.to_string(),
                target_revision: "HEAD".to_string(),
                path: path.to_string(),
                auto_sync: false,
            },
        );
    }

    pub fn patches(&self) -> Vec<(String, Value)> {
        self.patches.lock().unwrap().clone()
    }

    pub fn syncs(&self) -> Vec<String> {
        self.syncs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArgoCdClient for FakeArgo {
    async fn get(&self, app_name: &str) -> Result<Option<ArgoApplication>> {
        Ok(self.apps.lock().unwrap().get(app_name).cloned())
    }

    async fn patch(&self, app_name: &str, patch: &Value, _patch_type: PatchType) -> Result<()> {
        self.patches
            .lock()
            .unwrap()
            .push((app_name.to_string(), patch.clone()));
        Ok(())
    }

    async fn sync(&self, app_name: &str) -> Result<()> {
        self.syncs.lock().unwrap().push(app_name.to_string());
        Ok(())
    }
}

/// Target cluster holding HPAs keyed by name.
#[derive(Default)]
pub struct FakeCluster {
    hpas: Mutex<HashMap<String, i64>>,
}

impl FakeCluster {
    pub fn put_hpa(&self, name: &str, current_replicas: i64) {
        self.hpas
            .lock()
            .unwrap()
            .insert(name.to_string(), current_replicas);
    }
}

#[async_trait]
impl ClusterReader for FakeCluster {
    async fn get_resource(&self, _cluster_id: i64, resource: &ResourceRef) -> Result<Option<Value>> {
        Ok(self
            .hpas
            .lock()
            .unwrap()
            .get(&resource.name)
            .map(|n| json!({"status": {"currentReplicas": n}})))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Pending,
    Claimed,
    Completed,
}

/// Message bus keeping every published message in order.
#[derive(Default)]
pub struct FakeBus {
    messages: Mutex<Vec<(Message, Delivery)>>,
}

impl FakeBus {
    pub fn published(&self, topic: &str) -> Vec<Value> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m.topic == topic)
            .map(|(m, _)| m.payload.clone())
            .collect()
    }

    pub fn completed(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, d)| *d == Delivery::Completed)
            .map(|(m, _)| m.id.clone())
            .collect()
    }

    fn settle(&self, id: &str, delivery: Delivery) {
        if let Some(entry) = self
            .messages
            .lock()
            .unwrap()
            .iter_mut()
            .find(|(m, _)| m.id == id)
        {
            entry.1 = delivery;
        }
    }
}

#[async_trait]
impl EventBus for FakeBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<String> {
        let mut messages = self.messages.lock().unwrap();
        let id = format!("msg-{}", messages.len() + 1);
        messages.push((
            Message {
                id: id.clone(),
                topic: topic.to_string(),
                payload,
                attempts: 0,
            },
            Delivery::Pending,
        ));
        Ok(id)
    }
}

#[async_trait]
impl MessageSource for FakeBus {
    async fn claim(&self, _consumer: &str, topic: &str) -> Result<Option<Message>> {
        let mut messages = self.messages.lock().unwrap();
        let Some(entry) = messages
            .iter_mut()
            .find(|(m, d)| m.topic == topic && *d == Delivery::Pending)
        else {
            return Ok(None);
        };
        entry.0.attempts += 1;
        entry.1 = Delivery::Claimed;
        Ok(Some(entry.0.clone()))
    }

    async fn complete(&self, message_id: &str) -> Result<()> {
        self.settle(message_id, Delivery::Completed);
        Ok(())
    }

    async fn fail(&self, message_id: &str, _error: &str) -> Result<()> {
        self.settle(message_id, Delivery::Pending);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeExecutor {
    submissions: Mutex<Vec<WorkflowRequest>>,
    terminated: Mutex<Vec<String>>,
    failure: Mutex<Option<Failure>>,
}

impl FakeExecutor {
    pub fn submissions(&self) -> Vec<WorkflowRequest> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.terminated.lock().unwrap().clone()
    }

    pub fn fail_with(&self, failure: impl Fn() -> Error + Send + Sync + 'static) {
        *self.failure.lock().unwrap() = Some(Box::new(failure));
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn submit_workflow(&self, request: &WorkflowRequest) -> Result<WorkflowHandle> {
        if let Some(err) = self.failure.lock().unwrap().as_ref().map(|f| f()) {
            return Err(err);
        }
        self.submissions.lock().unwrap().push(request.clone());
        Ok(WorkflowHandle {
            name: request.name.clone(),
            namespace: request.namespace.clone(),
            executor: self.name().to_string(),
        })
    }

    async fn get_workflow(&self, _target: &WorkflowTarget) -> Result<Option<WorkflowSnapshot>> {
        Ok(None)
    }

    async fn terminate_workflow(&self, target: &WorkflowTarget) -> Result<()> {
        self.terminated.lock().unwrap().push(target.name.clone());
        Ok(())
    }

    async fn delete_workflow(&self, _target: &WorkflowTarget) -> Result<()> {
        Ok(())
    }
}

/// Fully wired collaborators over the fakes above, seeded with the chart,
/// env override, variable and registry most tests rely on.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub services: Arc<FakeServices>,
    pub helm: Arc<FakeHelm>,
    pub gitops: Arc<FakeGitOps>,
    pub argocd: Arc<FakeArgo>,
    pub cluster: Arc<FakeCluster>,
    pub bus: Arc<FakeBus>,
    pub executor: Arc<FakeExecutor>,
    pub deps: Collaborators,
    coordinator: Arc<ReleaseCoordinator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CdConfig::default())
    }

    pub fn with_config(config: CdConfig) -> Self {
        let store = Arc::new(MemoryStore::default());
        let services = Arc::new(FakeServices::default());
        let helm = Arc::new(FakeHelm::default());
        let gitops = Arc::new(FakeGitOps::default());
        let argocd = Arc::new(FakeArgo::default());
        let cluster = Arc::new(FakeCluster::default());
        let bus = Arc::new(FakeBus::default());
        let executor = Arc::new(FakeExecutor::default());

        store.put_chart(chart());
        store.put_env_override(EnvConfigOverride {
            id: 1,
            chart_id: 1,
            target_environment: 5,
            env_override_values: serde_json::from_str(SNAPSHOT_TEMPLATE).unwrap(),
            is_override: true,
            is_app_metrics_enabled: None,
            latest: true,
        });
        services.set_variable("replicas", "1");
        services.add_registry(DockerRegistry {
            id: "dest".to_string(),
            registry_url: "https://r.io/".to_string(),
            registry_type: "other".to_string(),
            username: "robot".to_string(),
            password: SecretString::new("hunter2"),
        });

        let deps = Collaborators::builder(config)
            .pipelines(store.clone())
            .artifacts(store.clone())
            .workflows(store.clone())
            .statuses(store.clone())
            .overrides(store.clone())
            .configs(store.clone())
            .history(store.clone())
            .custom_tags(store.clone())
            .executor(executor.clone())
            .helm(helm.clone())
            .gitops(gitops.clone())
            .argocd(argocd.clone())
            .cluster(cluster.clone())
            .bus(bus.clone())
            .scans(services.clone())
            .approvals(services.clone())
            .promotions(services.clone())
            .filters(services.clone())
            .registries(services.clone())
            .notifier(services.clone())
            .variables(services.clone())
            .build()
            .unwrap();
        let coordinator = Arc::new(ReleaseCoordinator::new(&deps));

        Self {
            store,
            services,
            helm,
            gitops,
            argocd,
            cluster,
            bus,
            executor,
            deps,
            coordinator,
        }
    }

    pub fn seed_pipeline(&self, id: i64) -> Pipeline {
        let p = pipeline(id);
        self.store.put_pipeline(p.clone());
        p
    }

    pub fn seed_artifact(&self, id: i64, image: &str) -> CiArtifact {
        let a = artifact(id, image);
        self.store.put_artifact(a.clone());
        a
    }

    /// A fresh workflow with an `Initiated` deploy runner.
    pub async fn deploy_runner(&self, pipeline_id: PipelineId, artifact_id: ArtifactId) -> CdWorkflowRunner {
        let workflow = self
            .store
            .create_workflow(pipeline_id, artifact_id, None)
            .await
            .unwrap();
        self.store
            .create_runner(NewRunner::deploy(
                workflow.id,
                pipeline_id,
                format!("cd-{pipeline_id}"),
                "payments-prod",
                1,
                None,
            ))
            .await
            .unwrap()
    }

    /// A fresh workflow with a `Starting` stage runner named `name`.
    pub async fn stage_runner(
        &self,
        pipeline_id: PipelineId,
        workflow_type: WorkflowType,
        name: &str,
    ) -> CdWorkflowRunner {
        let workflow = self
            .store
            .create_workflow(pipeline_id, ArtifactId(42), None)
            .await
            .unwrap();
        self.store
            .create_runner(NewRunner {
                workflow_id: workflow.id,
                pipeline_id,
                workflow_type,
                executor_type: ExecutorType::ArgoWorkflow,
                name: name.to_string(),
                status: RunnerStatus::Starting,
                triggered_by: 1,
                started_on: Utc::now(),
                namespace: "devtron-cd".to_string(),
                log_location: None,
                ref_runner_id: None,
                reference_id: None,
            })
            .await
            .unwrap()
    }

    /// A deploy request whose runner already passed validation, ready for
    /// the coordinator.
    pub async fn validated_request(&self, pipeline_id: i64, artifact_id: i64) -> ValuesOverrideRequest {
        let runner = self
            .deploy_runner(PipelineId(pipeline_id), ArtifactId(artifact_id))
            .await;
        self.recorder()
            .append_timeline(
                runner.id,
                TimelineStatus::DeploymentRequestValidated,
                DESCRIPTION_REQUEST_VALIDATED,
            )
            .await
            .unwrap();
        let mut request = ValuesOverrideRequest::new(
            PipelineId(pipeline_id),
            ArtifactId(artifact_id),
            WorkflowType::Deploy,
            1,
        );
        request.wfr_id = Some(runner.id);
        request.cd_workflow_id = Some(runner.workflow_id);
        request
    }

    pub fn recorder(&self) -> StatusRecorder {
        StatusRecorder::from_collaborators(&self.deps)
    }

    pub fn engine(&self) -> ReleaseEngine {
        ReleaseEngine::new(&self.deps)
    }

    pub fn coordinator(&self) -> Arc<ReleaseCoordinator> {
        self.coordinator.clone()
    }

    pub fn orchestrator(&self) -> TriggerOrchestrator {
        TriggerOrchestrator::new(&self.deps, self.coordinator())
    }

    pub fn orchestrator_arc(&self) -> Arc<TriggerOrchestrator> {
        Arc::new(self.orchestrator())
    }
}
