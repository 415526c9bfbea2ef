//! Pre- and post-deployment stage runs.
//!
//! A stage run is one workflow submitted to the executor. The runner row is
//! created up front in `Starting`, gated, and only then submitted; anything
//! that fails before submission terminates the runner with the reason.

use chrono::Utc;
use deckhand_config::referenced_variables;
use deckhand_core::artifact::{ArtifactSource, CiArtifact, NewArtifact, PluginArtifacts};
use deckhand_core::executor::{
    DeployInfo, WorkflowHandle, WorkflowRequest, WorkflowStatusEvent, WorkflowTarget,
};
use deckhand_core::history::{FilterAudit, StageScriptHistory};
use deckhand_core::pipeline::{Pipeline, PipelineStage, StageType};
use deckhand_core::services::{NotificationEvent, NotificationKind, VariableScope};
use deckhand_core::workflow::{CdWorkflowRunner, NewRunner, RunnerStatus, WorkflowType};
use deckhand_core::{ArtifactId, Error, PipelineId, Result, RunnerId, WorkflowId};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::custom_tag::{CopyImagePlan, ImageReservations};
use crate::deps::Collaborators;
use crate::gates::{FILTER_BLOCKED_MESSAGE, GateEvaluator};
use crate::recorder::StatusRecorder;
use crate::release::config_source::ConfigSource;

/// How a stage is defined on its pipeline.
#[derive(Debug, Clone)]
pub enum StageDefinition {
    /// Legacy YAML script.
    Yaml(String),
    /// Structured steps, possibly with plugin references.
    Steps(PipelineStage),
}

impl StageDefinition {
    fn yaml(&self) -> Option<String> {
        match self {
            StageDefinition::Yaml(yaml) => Some(yaml.clone()),
            StageDefinition::Steps(_) => None,
        }
    }

    fn steps(&self) -> Result<Value> {
        match self {
            StageDefinition::Yaml(_) => Ok(Value::Null),
            StageDefinition::Steps(stage) => serde_json::to_value(&stage.steps)
                .map_err(|e| Error::Internal(format!("encode stage steps: {e}"))),
        }
    }
}

/// A request to run a stage.
#[derive(Debug, Clone)]
pub struct StageRequest {
    pub pipeline_id: PipelineId,
    pub artifact_id: ArtifactId,
    pub stage: StageType,
    /// Workflow to attach to; a new one is created when absent.
    pub workflow_id: Option<WorkflowId>,
    pub triggered_by: i64,
    pub reference_id: Option<String>,
    /// Manual triggers are refused by failing filters, automatic ones only audited.
    pub manual: bool,
}

pub fn stage_runner_name(pipeline_id: PipelineId, stage: StageType, workflow_id: WorkflowId) -> String {
    format!(
        "cd-{}-{}-{}",
        pipeline_id,
        stage.as_str().to_lowercase(),
        workflow_id
    )
}

pub struct StageRunner {
    deps: Collaborators,
    recorder: StatusRecorder,
    gates: GateEvaluator,
    reservations: ImageReservations,
    config_source: ConfigSource,
}

impl StageRunner {
    pub fn new(deps: &Collaborators) -> Self {
        Self {
            deps: deps.clone(),
            recorder: StatusRecorder::from_collaborators(deps),
            gates: GateEvaluator::from_collaborators(deps),
            reservations: ImageReservations::from_collaborators(deps),
            config_source: ConfigSource::new(
                deps.configs.clone(),
                deps.history.clone(),
                deps.variables.clone(),
            ),
        }
    }

    /// The stage's definition, if the pipeline has one.
    ///
    /// Legacy YAML wins over structured steps. A structured stage without
    /// steps is corrupted and gets deleted, leaving the stage undefined.
    pub async fn definition(
        &self,
        pipeline: &Pipeline,
        stage: StageType,
    ) -> Result<Option<StageDefinition>> {
        if let Some(yaml) = pipeline.stage_yaml(stage) {
            return Ok(Some(StageDefinition::Yaml(yaml.to_string())));
        }
        let Some(structured) = self.deps.pipelines.get_stage(pipeline.id, stage).await? else {
            return Ok(None);
        };
        if structured.is_corrupted() {
            warn!(
                pipeline_id = %pipeline.id,
                stage = stage.as_str(),
                stage_id = structured.id,
                "Deleting stage without steps"
            );
            self.deps.pipelines.delete_stage(structured.id).await?;
            return Ok(None);
        }
        Ok(Some(StageDefinition::Steps(structured)))
    }

    /// Create, gate and submit a stage runner.
    ///
    /// Gate refusals and submission failures leave the runner terminated with
    /// the reason and are returned as errors.
    pub async fn trigger(&self, request: &StageRequest) -> Result<CdWorkflowRunner> {
        let pipeline = self.deps.pipelines.get(request.pipeline_id).await?;
        let artifact = self.deps.artifacts.get(request.artifact_id).await?;
        let definition = self.definition(&pipeline, request.stage).await?.ok_or_else(|| {
            Error::InvalidInput(format!(
                "pipeline {} has no {} stage",
                pipeline.id,
                request.stage.as_str()
            ))
        })?;

        let workflow_id = match request.workflow_id {
            Some(id) => id,
            None => {
                self.deps
                    .workflows
                    .create_workflow(pipeline.id, artifact.id, None)
                    .await?
                    .id
            }
        };
        let runner = self.create_runner(&pipeline, request, workflow_id).await?;
        info!(
            runner_id = %runner.id,
            pipeline_id = %pipeline.id,
            stage = request.stage.as_str(),
            "Stage runner created"
        );

        if self.gates.is_vulnerable(&pipeline, &artifact).await? {
            self.recorder.fail_vulnerable(runner.id, &artifact.image_digest).await?;
            self.notify(&pipeline, &runner, NotificationKind::Blocked, None).await;
            return Err(Error::Blocked(format!(
                "found vulnerability for image digest {}",
                artifact.image_digest
            )));
        }

        let evaluation = self.gates.evaluate_filters(&pipeline, &artifact).await?;
        self.deps
            .history
            .save_filter_audit(&FilterAudit {
                runner_id: runner.id,
                filter_ids: evaluation.filter_ids.clone(),
                allowed: evaluation.allowed,
                evaluated_on: Utc::now(),
            })
            .await?;
        if !evaluation.allowed && request.manual {
            self.recorder
                .set_runner_status(runner.id, RunnerStatus::Failed, FILTER_BLOCKED_MESSAGE)
                .await?;
            return Err(Error::Blocked(FILTER_BLOCKED_MESSAGE.to_string()));
        }

        let plan = match self.reserve_copy_image(&pipeline, request.stage, &definition, &artifact).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(runner_id = %runner.id, error = %e, "Copy-image reservation failed");
                self.recorder
                    .set_runner_status(runner.id, RunnerStatus::Failed, &e.runner_message())
                    .await?;
                return Err(e);
            }
        };
        let reservation_ids = plan
            .as_ref()
            .map(|p| p.reservation_ids.clone())
            .unwrap_or_default();

        let submitted = self
            .submit(&pipeline, &artifact, &runner, &definition, plan)
            .await;
        let (handle, variables) = match submitted {
            Ok(submitted) => submitted,
            Err(e) => {
                warn!(runner_id = %runner.id, error = %e, "Stage submission failed");
                self.reservations.release(&reservation_ids).await;
                self.recorder
                    .set_runner_status(runner.id, RunnerStatus::Failed, &e.runner_message())
                    .await?;
                self.notify(&pipeline, &runner, NotificationKind::Fail, Some(e.runner_message()))
                    .await;
                return Err(e);
            }
        };

        self.record_snapshot(&pipeline, &runner, &variables).await;

        let mut runner = runner;
        runner.namespace = handle.namespace.clone();
        runner.image_path_reservation_ids = reservation_ids;
        self.deps.workflows.update_runner_details(&runner).await?;

        let history = StageScriptHistory {
            runner_id: runner.id,
            pipeline_id: pipeline.id,
            stage_yaml: definition.yaml(),
            steps: definition.steps()?,
            triggered_on: runner.started_on,
            triggered_by: runner.triggered_by,
        };
        if let Err(e) = self.deps.history.save_stage_history(&history).await {
            warn!(runner_id = %runner.id, error = %e, "Failed to record stage history");
        }
        self.notify(&pipeline, &runner, NotificationKind::Trigger, None).await;
        info!(
            runner_id = %runner.id,
            workflow = %handle.name,
            executor = %handle.executor,
            "Stage submitted"
        );
        Ok(runner)
    }

    /// Record the deployment template, config maps, secrets, strategy and
    /// variables in effect for the stage against its runner.
    async fn record_snapshot(
        &self,
        pipeline: &Pipeline,
        runner: &CdWorkflowRunner,
        variables: &BTreeMap<String, String>,
    ) {
        let snapshot = match self
            .config_source
            .stage_snapshot(pipeline, runner.triggered_by, variables)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(runner_id = %runner.id, error = %e, "Failed to resolve stage configuration");
                return;
            }
        };
        if let Err(e) = self.deps.history.save_snapshot(runner.id, &snapshot).await {
            warn!(runner_id = %runner.id, error = %e, "Failed to record stage configuration");
        }
    }

    async fn create_runner(
        &self,
        pipeline: &Pipeline,
        request: &StageRequest,
        workflow_id: WorkflowId,
    ) -> Result<CdWorkflowRunner> {
        let config = &self.deps.config;
        let namespace = if pipeline.stage_runs_in_env(request.stage) {
            pipeline.namespace.clone()
        } else {
            config.default_namespace.clone()
        };
        let ref_runner_id = match request.stage {
            StageType::Pre => None,
            StageType::Post => self
                .deps
                .workflows
                .find_runner(workflow_id, WorkflowType::Deploy)
                .await?
                .map(|r| r.id),
        };
        let workflow_type = request.stage.workflow_type();
        let new = NewRunner {
            workflow_id,
            pipeline_id: pipeline.id,
            workflow_type,
            executor_type: config.default_executor,
            name: stage_runner_name(pipeline.id, request.stage, workflow_id),
            status: RunnerStatus::Starting,
            triggered_by: request.triggered_by,
            started_on: Utc::now(),
            namespace,
            log_location: Some(format!(
                "{}/{}{}-{}/main.log",
                config.log_location_prefix, workflow_id, workflow_type, pipeline.name
            )),
            ref_runner_id,
            reference_id: request.reference_id.clone(),
        };
        Ok(self.deps.workflows.create_runner(new).await?)
    }

    async fn reserve_copy_image(
        &self,
        pipeline: &Pipeline,
        stage: StageType,
        definition: &StageDefinition,
        artifact: &CiArtifact,
    ) -> Result<Option<CopyImagePlan>> {
        let StageDefinition::Steps(structured) = definition else {
            return Ok(None);
        };
        let Some(plugin) = structured.copy_image_plugin() else {
            return Ok(None);
        };
        let plan = self
            .reservations
            .reserve(pipeline.id, stage, plugin, artifact)
            .await?;
        Ok(Some(plan))
    }

    async fn submit(
        &self,
        pipeline: &Pipeline,
        artifact: &CiArtifact,
        runner: &CdWorkflowRunner,
        definition: &StageDefinition,
        plan: Option<CopyImagePlan>,
    ) -> Result<(WorkflowHandle, BTreeMap<String, String>)> {
        let stage = match runner.workflow_type {
            WorkflowType::Pre => StageType::Pre,
            WorkflowType::Post => StageType::Post,
            WorkflowType::Deploy => {
                return Err(Error::Invariant(format!(
                    "runner {} is not a stage runner",
                    runner.id
                )));
            }
        };
        let steps = definition.steps()?;
        let stage_yaml = definition.yaml();

        let mut names = referenced_variables(&steps);
        if let Some(yaml) = &stage_yaml {
            names.extend(referenced_variables(&Value::String(yaml.clone())));
        }
        let variables = if names.is_empty() {
            BTreeMap::new()
        } else {
            let names: Vec<String> = names.into_iter().collect();
            self.deps
                .variables
                .resolve(&VariableScope::from(pipeline), &names)
                .await?
        };

        let deploy_info = match (stage, runner.ref_runner_id) {
            (StageType::Post, Some(deploy_runner)) => Some(self.deploy_info(runner.workflow_id, deploy_runner).await?),
            _ => None,
        };

        let request = WorkflowRequest {
            name: runner.name.clone(),
            runner_id: runner.id,
            workflow_id: runner.workflow_id,
            pipeline_id: pipeline.id,
            pipeline_name: pipeline.name.clone(),
            app_id: pipeline.app_id,
            env_id: pipeline.env_id,
            cluster_id: pipeline.cluster_id,
            stage_type: stage,
            executor_type: runner.executor_type,
            namespace: runner.namespace.clone(),
            run_in_env: pipeline.stage_runs_in_env(stage),
            ci_artifact_id: artifact.id,
            image: artifact.image.clone(),
            image_digest: artifact.image_digest.clone(),
            stage_yaml,
            steps,
            env_vars: self.env_vars(pipeline, artifact).await?,
            variables: variables.clone(),
            log_location: runner.log_location.clone(),
            copy_image: plan.map(|p| p.spec),
            deploy_info,
            triggered_by: runner.triggered_by,
        };
        debug!(runner_id = %runner.id, executor = self.deps.executor.name(), "Submitting stage workflow");
        let handle = self.deps.executor.submit_workflow(&request).await?;
        Ok((handle, variables))
    }

    async fn deploy_info(&self, workflow_id: WorkflowId, deploy_runner: RunnerId) -> Result<DeployInfo> {
        let runner = self.deps.workflows.get_runner(deploy_runner).await?;
        let release_counter = self
            .deps
            .overrides
            .find_by_workflow(workflow_id)
            .await?
            .map(|o| o.pipeline_release_counter);
        Ok(DeployInfo {
            deploy_runner_id: runner.id,
            triggered_at: runner.started_on,
            triggered_by: runner.triggered_by,
            release_counter,
        })
    }

    /// Extra environment for the stage container: git metadata, app labels
    /// and the ids of child pipelines.
    async fn env_vars(
        &self,
        pipeline: &Pipeline,
        artifact: &CiArtifact,
    ) -> Result<BTreeMap<String, String>> {
        let mut env = BTreeMap::new();
        env.insert("APP_NAME".to_string(), pipeline.app_name.clone());
        env.insert("ENV_NAME".to_string(), pipeline.env_name.clone());
        env.insert("DOCKER_IMAGE".to_string(), artifact.image.clone());
        let hashes = artifact.commit_hashes();
        if let Some(first) = hashes.first() {
            env.insert("GIT_COMMIT_HASH".to_string(), first.clone());
        }
        if !hashes.is_empty() {
            env.insert("GIT_COMMIT_HASHES".to_string(), hashes.join(","));
        }
        for (key, value) in self.deps.configs.app_labels(pipeline.app_id).await? {
            env.insert(key, value);
        }
        let children = self.deps.pipelines.find_children(pipeline.id).await?;
        if !children.is_empty() {
            let ids: Vec<String> = children.iter().map(|c| c.id.to_string()).collect();
            env.insert("CHILD_CD_PIPELINE_IDS".to_string(), ids.join(","));
        }
        Ok(env)
    }

    /// Record images produced by a finished stage's plugins as artifacts of
    /// the pipeline. Images already recorded are not duplicated.
    ///
    /// Returns the newest artifact the stage produced, if any.
    pub async fn persist_plugin_artifacts(
        &self,
        pipeline: &Pipeline,
        stage: StageType,
        parent: &CiArtifact,
        produced: &PluginArtifacts,
    ) -> Result<Option<CiArtifact>> {
        let images: Vec<String> = produced.values().flatten().cloned().collect();
        if images.is_empty() {
            return Ok(None);
        }
        let existing = self.deps.artifacts.find_by_images(pipeline.id, &images).await?;
        let data_source = match stage {
            StageType::Pre => ArtifactSource::PreCd,
            StageType::Post => ArtifactSource::PostCd,
        };
        let mut fresh = Vec::new();
        for (registry, images) in produced {
            for image in images {
                let seen = existing.iter().any(|a| &a.image == image)
                    || fresh.iter().any(|n: &NewArtifact| &n.image == image);
                if seen {
                    continue;
                }
                fresh.push(NewArtifact {
                    image: image.clone(),
                    image_digest: String::new(),
                    material_info: parent.material_info.clone(),
                    data_source,
                    cd_pipeline_id: pipeline.id,
                    parent_ci_artifact: parent.root_id(),
                    credentials_source: Some(registry.clone()),
                    scan_enabled: parent.scan_enabled,
                    scanned: parent.scanned,
                });
            }
        }
        if fresh.is_empty() {
            debug!(pipeline_id = %pipeline.id, "Plugin images already recorded");
            return Ok(existing.into_iter().max_by_key(|a| a.id));
        }
        let created = self.deps.artifacts.create_many(&fresh).await?;
        info!(pipeline_id = %pipeline.id, count = created.len(), "Recorded plugin artifacts");
        Ok(created.into_iter().max_by_key(|a| a.id))
    }

    /// Apply an executor status event to its stage runner. A runner that
    /// ends without succeeding releases its image path reservations.
    pub async fn on_workflow_event(&self, event: &WorkflowStatusEvent) -> Result<Option<CdWorkflowRunner>> {
        let updated = self
            .recorder
            .apply_workflow_event(event, &self.deps.config.workflow_template_name)
            .await?;
        let Some(runner) = updated else {
            return Ok(None);
        };
        if runner.status.is_terminal() {
            if runner.status != RunnerStatus::Succeeded {
                self.reservations.release(&runner.image_path_reservation_ids).await;
            }
            let kind = if runner.status == RunnerStatus::Succeeded {
                NotificationKind::Success
            } else {
                NotificationKind::Fail
            };
            match self.deps.pipelines.get(runner.pipeline_id).await {
                Ok(pipeline) => {
                    let message = (!runner.message.is_empty()).then(|| runner.message.clone());
                    self.notify(&pipeline, &runner, kind, message).await;
                }
                Err(e) => warn!(runner_id = %runner.id, error = %e, "Pipeline gone, skipping notification"),
            }
        }
        Ok(Some(runner))
    }

    /// Stop a running stage on user request.
    pub async fn cancel(&self, runner_id: RunnerId, user_id: i64) -> Result<CdWorkflowRunner> {
        let runner = self.deps.workflows.get_runner(runner_id).await?;
        if runner.workflow_type == WorkflowType::Deploy {
            return Err(Error::InvalidInput(format!(
                "runner {runner_id} is a deployment, not a stage"
            )));
        }
        if runner.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "runner {runner_id} already finished with status {}",
                runner.status
            )));
        }

        let target = WorkflowTarget::in_cluster(&runner.name, &runner.namespace);
        match self.deps.executor.terminate_workflow(&target).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(runner_id = %runner_id, "Workflow already gone");
            }
            Err(e) => return Err(e),
        }
        self.reservations.release(&runner.image_path_reservation_ids).await;
        self.recorder
            .set_runner_status(
                runner_id,
                RunnerStatus::Cancelled,
                &format!("cancelled by user {user_id}"),
            )
            .await?;
        info!(runner_id = %runner_id, user_id, "Stage cancelled");
        Ok(self.deps.workflows.get_runner(runner_id).await?)
    }

    async fn notify(
        &self,
        pipeline: &Pipeline,
        runner: &CdWorkflowRunner,
        kind: NotificationKind,
        message: Option<String>,
    ) {
        let event = NotificationEvent {
            kind,
            pipeline_id: pipeline.id,
            app_id: pipeline.app_id,
            env_id: pipeline.env_id,
            runner_id: runner.id,
            workflow_type: runner.workflow_type,
            triggered_by: runner.triggered_by,
            message,
            time: Utc::now(),
        };
        if let Err(e) = self.deps.notifier.send(event).await {
            warn!(runner_id = %runner.id, error = %e, "Failed to send notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, copy_image_plugin};
    use deckhand_core::executor::{NodePhase, WorkflowNode, WorkflowPhase};
    use deckhand_core::pipeline::{StageStep, StepKind};
    use deckhand_core::services::{ConditionKind, FilterCondition, FilterScope, FilterSubject, ResourceFilter};
    use deckhand_core::tag::ENTITY_PRE_CD;
    use std::collections::BTreeMap;

    fn pre_request(pipeline: i64, artifact: i64) -> StageRequest {
        StageRequest {
            pipeline_id: PipelineId(pipeline),
            artifact_id: ArtifactId(artifact),
            stage: StageType::Pre,
            workflow_id: None,
            triggered_by: 1,
            reference_id: None,
            manual: false,
        }
    }

    fn steps(pipeline: i64, kinds: Vec<StepKind>) -> PipelineStage {
        PipelineStage {
            id: 70,
            pipeline_id: PipelineId(pipeline),
            stage_type: StageType::Pre,
            steps: kinds
                .into_iter()
                .enumerate()
                .map(|(i, kind)| StageStep {
                    index: i as u32 + 1,
                    name: format!("step-{}", i + 1),
                    kind,
                })
                .collect(),
        }
    }

    fn seed_yaml_pipeline(h: &Harness) {
        let mut p = h.seed_pipeline(10);
        p.pre_stage_yaml = Some("version: 0.0.1\ncdPipelineConf:\n  - script: echo @{{greeting}}".to_string());
        h.store.put_pipeline(p);
    }

    #[tokio::test]
    async fn test_yaml_stage_is_submitted_with_variables() {
        let h = Harness::new();
        seed_yaml_pipeline(&h);
        h.seed_artifact(42, "r.io/a:v1");
        h.services.set_variable("greeting", "hello");

        let runner = StageRunner::new(&h.deps).trigger(&pre_request(10, 42)).await.unwrap();
        assert_eq!(runner.status, RunnerStatus::Starting);
        assert_eq!(runner.name, format!("cd-10-pre-{}", runner.workflow_id));
        assert_eq!(runner.namespace, "devtron-cd");
        assert_eq!(
            runner.log_location.as_deref(),
            Some(format!("arsenal-v1/{}PRE-cd-10/main.log", runner.workflow_id).as_str())
        );

        let submitted = h.executor.submissions();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].variables.get("greeting").map(String::as_str), Some("hello"));
        assert_eq!(submitted[0].env_vars.get("DOCKER_IMAGE").map(String::as_str), Some("r.io/a:v1"));
        assert!(h.store.stage_history(runner.id).is_some());
        assert!(h.store.filter_audit(runner.id).is_some_and(|a| a.allowed));
    }

    #[tokio::test]
    async fn test_stage_run_records_configuration_snapshot() {
        let h = Harness::new();
        seed_yaml_pipeline(&h);
        h.seed_artifact(42, "r.io/a:v1");
        h.services.set_variable("greeting", "hello");

        let runner = StageRunner::new(&h.deps).trigger(&pre_request(10, 42)).await.unwrap();
        let snapshot = h.store.snapshot_of(runner.id).expect("stage snapshot");
        let chart = crate::testing::chart();
        assert_eq!(snapshot.deployment_template.pipeline_id, PipelineId(10));
        assert_eq!(snapshot.deployment_template.chart_version, chart.chart_version);
        assert_eq!(snapshot.deployment_template.deployed_by, 1);
        assert_eq!(snapshot.variables.get("greeting").map(String::as_str), Some("hello"));
    }

    #[tokio::test]
    async fn test_failed_submission_records_no_snapshot() {
        let h = Harness::new();
        seed_yaml_pipeline(&h);
        h.seed_artifact(42, "r.io/a:v1");
        h.executor.fail_with(|| Error::ExecutionFailed("quota exceeded".to_string()));

        assert!(StageRunner::new(&h.deps).trigger(&pre_request(10, 42)).await.is_err());
        let stage = h.store.stage_runners(PipelineId(10));
        assert!(h.store.snapshot_of(stage[0].id).is_none());
    }

    #[tokio::test]
    async fn test_vulnerable_image_blocks_stage() {
        let h = Harness::new();
        seed_yaml_pipeline(&h);
        let mut a = h.seed_artifact(42, "r.io/a:v1");
        a.image_digest = "sha256:bad".to_string();
        h.store.put_artifact(a);
        h.services.scan("sha256:bad", &["CVE-2024-1"]);
        h.services.block_cve(5, "CVE-2024-1");

        let err = StageRunner::new(&h.deps).trigger(&pre_request(10, 42)).await.unwrap_err();
        assert!(matches!(err, Error::Blocked(_)));
        assert!(h.executor.submissions().is_empty());

        let runner = h.store.deploy_runners(PipelineId(10));
        assert!(runner.is_empty());
        let stage = h.store.stage_runners(PipelineId(10));
        assert_eq!(stage.len(), 1);
        assert_eq!(stage[0].status, RunnerStatus::Failed);
        assert!(stage[0].message.contains("sha256:bad"));
    }

    #[tokio::test]
    async fn test_failing_filter_blocks_only_manual_trigger() {
        let h = Harness::new();
        seed_yaml_pipeline(&h);
        h.seed_artifact(42, "r.io/a:v1");
        h.seed_artifact(43, "r.io/a:v2");
        h.services.add_filter(ResourceFilter {
            id: 9,
            name: "only-v2".to_string(),
            scope: FilterScope::default(),
            conditions: vec![FilterCondition {
                kind: ConditionKind::Pass,
                subject: FilterSubject::ImageTag,
                pattern: "^v2$".to_string(),
            }],
        });
        let stages = StageRunner::new(&h.deps);

        let auto = stages.trigger(&pre_request(10, 42)).await.unwrap();
        assert_eq!(h.store.filter_audit(auto.id).map(|a| a.allowed), Some(false));

        let mut manual = pre_request(10, 42);
        manual.manual = true;
        let err = stages.trigger(&manual).await.unwrap_err();
        assert_eq!(err.to_string(), FILTER_BLOCKED_MESSAGE);
        assert_eq!(h.executor.submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_reserved_destination_fails_stage_without_submission() {
        let h = Harness::new();
        h.seed_pipeline(10);
        h.seed_artifact(42, "r.io/a:v1");
        h.store.put_stage(steps(10, vec![StepKind::RefPlugin(copy_image_plugin("dest|mirror"))]));
        h.store.add_custom_tag(ENTITY_PRE_CD, "10", "build-{x}", 7);
        h.store.reserve_existing("r.io/mirror:build-7");

        let err = StageRunner::new(&h.deps).trigger(&pre_request(10, 42)).await.unwrap_err();
        assert!(err.to_string().contains("ErrImagePathInUse"));
        assert!(h.executor.submissions().is_empty());
        let stage = h.store.stage_runners(PipelineId(10));
        assert_eq!(stage[0].status, RunnerStatus::Failed);
        assert!(stage[0].message.contains("ErrImagePathInUse"));
        assert_eq!(h.store.custom_tag_counter(ENTITY_PRE_CD, "10"), Some(7));
    }

    #[tokio::test]
    async fn test_submission_failure_releases_reservations() {
        let h = Harness::new();
        h.seed_pipeline(10);
        h.seed_artifact(42, "r.io/a:v1");
        h.store.put_stage(steps(10, vec![StepKind::RefPlugin(copy_image_plugin("dest|mirror"))]));
        h.executor.fail_with(|| Error::ExecutionFailed("quota exceeded".to_string()));

        let err = StageRunner::new(&h.deps).trigger(&pre_request(10, 42)).await.unwrap_err();
        assert!(matches!(err, Error::ExecutionFailed(_)));
        assert!(!h.store.path_reserved("r.io/mirror:v1"));
        let stage = h.store.stage_runners(PipelineId(10));
        assert_eq!(stage[0].status, RunnerStatus::Failed);
    }

    #[tokio::test]
    async fn test_copy_image_plan_travels_with_request() {
        let h = Harness::new();
        h.seed_pipeline(10);
        h.seed_artifact(42, "r.io/a:v1");
        h.store.put_stage(steps(10, vec![StepKind::RefPlugin(copy_image_plugin("dest|mirror"))]));

        let runner = StageRunner::new(&h.deps).trigger(&pre_request(10, 42)).await.unwrap();
        let submitted = h.executor.submissions();
        let copy = submitted[0].copy_image.as_ref().unwrap();
        assert_eq!(copy.destinations, vec!["r.io/mirror:v1".to_string()]);
        assert!(h.store.path_reserved("r.io/mirror:v1"));
        assert_eq!(h.store.runner(runner.id).image_path_reservation_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupted_stage_is_deleted() {
        let h = Harness::new();
        let pipeline = h.seed_pipeline(10);
        h.store.put_stage(steps(10, Vec::new()));

        let stages = StageRunner::new(&h.deps);
        assert!(stages.definition(&pipeline, StageType::Pre).await.unwrap().is_none());
        assert!(h.store.stage_deleted(70));
    }

    #[tokio::test]
    async fn test_plugin_artifacts_are_not_duplicated() {
        let h = Harness::new();
        let pipeline = h.seed_pipeline(10);
        let parent = h.seed_artifact(42, "r.io/a:v1");
        let produced: PluginArtifacts =
            BTreeMap::from([("dest".to_string(), vec!["r.io/mirror:v1".to_string()])]);
        let stages = StageRunner::new(&h.deps);

        let first = stages
            .persist_plugin_artifacts(&pipeline, StageType::Pre, &parent, &produced)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.data_source, ArtifactSource::PreCd);
        assert_eq!(first.parent_ci_artifact, Some(ArtifactId(42)));
        assert_eq!(first.credentials_source.as_deref(), Some("dest"));

        let again = stages
            .persist_plugin_artifacts(&pipeline, StageType::Pre, &parent, &produced)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, first.id);
    }

    #[tokio::test]
    async fn test_failed_workflow_releases_reservations() {
        let h = Harness::new();
        h.seed_pipeline(10);
        h.seed_artifact(42, "r.io/a:v1");
        h.store.put_stage(steps(10, vec![StepKind::RefPlugin(copy_image_plugin("dest|mirror"))]));
        let stages = StageRunner::new(&h.deps);
        let runner = stages.trigger(&pre_request(10, 42)).await.unwrap();

        let event = WorkflowStatusEvent {
            name: runner.name.clone(),
            phase: WorkflowPhase::Failed,
            message: String::new(),
            finished_at: Some(Utc::now()),
            nodes: BTreeMap::from([(
                format!("{}-1", runner.name),
                WorkflowNode {
                    template_name: "cd".to_string(),
                    phase: NodePhase::Failed,
                    message: "exit 1".to_string(),
                    boundary_id: String::new(),
                    outputs: None,
                },
            )]),
        };
        let updated = stages.on_workflow_event(&event).await.unwrap().unwrap();
        assert_eq!(updated.status, RunnerStatus::Failed);
        assert!(!h.store.path_reserved("r.io/mirror:v1"));
    }

    #[tokio::test]
    async fn test_cancel_terminates_workflow() {
        let h = Harness::new();
        seed_yaml_pipeline(&h);
        h.seed_artifact(42, "r.io/a:v1");
        let stages = StageRunner::new(&h.deps);
        let runner = stages.trigger(&pre_request(10, 42)).await.unwrap();

        let cancelled = stages.cancel(runner.id, 7).await.unwrap();
        assert_eq!(cancelled.status, RunnerStatus::Cancelled);
        assert_eq!(h.executor.terminated(), vec![runner.name.clone()]);

        let err = stages.cancel(runner.id, 7).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }
}
