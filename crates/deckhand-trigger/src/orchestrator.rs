//! Trigger orchestration.
//!
//! Decides what runs next for a pipeline (pre stage, deployment, post stage
//! or child pipelines) in response to CI completions, stage completions,
//! manual requests and bulk operations.

use chrono::Utc;
use deckhand_core::artifact::{ArtifactSource, CiArtifact};
use deckhand_core::events::{
    AsyncCdDeployEvent, BulkTriggerRequest, CdStageCompleteEvent, DeploymentGroupAppWithEnv,
    PipelineDeletedEvent, publish_json, topics,
};
use deckhand_core::pipeline::{Pipeline, StageType};
use deckhand_core::release::{DeploymentOutcome, DeploymentType, ValuesOverrideRequest};
use deckhand_core::services::{NotificationEvent, NotificationKind};
use deckhand_core::timeline::{
    DESCRIPTION_DEPLOYMENT_INITIATED, DESCRIPTION_REQUEST_VALIDATED, TimelineStatus,
};
use deckhand_core::workflow::{
    CdWorkflowRunner, NewRunner, RunnerStatus, WorkflowStatus, WorkflowType,
};
use deckhand_core::{ArtifactId, Error, PipelineId, Result, RunnerId, WorkflowId};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::coordinator::ReleaseCoordinator;
use crate::deps::Collaborators;
use crate::gates::{FILTER_BLOCKED_MESSAGE, GateEvaluator};
use crate::recorder::StatusRecorder;
use crate::stage::{StageRequest, StageRunner};

/// What an automatic trigger started for one pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Started {
    Stage(RunnerId),
    Deployment(RunnerId),
}

/// Runner reference for work fanned out from one message to many pipelines.
fn scoped_reference(reference_id: Option<&str>, pipeline_id: PipelineId) -> Option<String> {
    reference_id.map(|r| format!("{r}:{pipeline_id}"))
}

pub struct TriggerOrchestrator {
    deps: Collaborators,
    recorder: StatusRecorder,
    gates: GateEvaluator,
    stages: StageRunner,
    coordinator: Arc<ReleaseCoordinator>,
}

impl TriggerOrchestrator {
    pub fn new(deps: &Collaborators, coordinator: Arc<ReleaseCoordinator>) -> Self {
        Self {
            deps: deps.clone(),
            recorder: StatusRecorder::from_collaborators(deps),
            gates: GateEvaluator::from_collaborators(deps),
            stages: StageRunner::new(deps),
            coordinator,
        }
    }

    pub fn coordinator(&self) -> &Arc<ReleaseCoordinator> {
        &self.coordinator
    }

    pub fn stages(&self) -> &StageRunner {
        &self.stages
    }

    /// Fan a finished CI build out to the CD pipelines it feeds.
    ///
    /// Each pipeline is handled independently: one failing does not stop the
    /// others. Returns what was started.
    pub async fn handle_ci_success(
        &self,
        artifact_id: ArtifactId,
        triggered_by: i64,
        reference_id: Option<&str>,
    ) -> Result<Vec<Started>> {
        let artifact = self.deps.artifacts.get(artifact_id).await?;
        let source_pipeline = match artifact.data_source {
            ArtifactSource::PostCi => artifact.component_id,
            _ => artifact.ci_pipeline_id,
        };
        let Some(ci_pipeline_id) = source_pipeline else {
            debug!(artifact_id = %artifact_id, "Artifact has no CI pipeline, nothing to trigger");
            return Ok(Vec::new());
        };

        let pipelines = self.deps.pipelines.find_by_ci_pipeline(ci_pipeline_id).await?;
        info!(artifact_id = %artifact_id, ci_pipeline_id, pipelines = pipelines.len(), "CI build finished");
        Ok(self
            .trigger_each(&pipelines, &artifact, triggered_by, reference_id)
            .await)
    }

    /// Handle an artifact pushed through an external-CI webhook.
    ///
    /// Pipelines with a manual trigger, or that `authorize` refuses, are
    /// skipped.
    pub async fn handle_webhook_external_ci(
        &self,
        artifact_id: ArtifactId,
        external_ci_id: i64,
        triggered_by: i64,
        reference_id: Option<&str>,
        authorize: &(dyn Fn(&Pipeline) -> bool + Send + Sync),
    ) -> Result<Vec<Started>> {
        let artifact = self.deps.artifacts.get(artifact_id).await?;
        let candidates = self.deps.pipelines.find_by_external_ci(external_ci_id).await?;
        let mut allowed = Vec::with_capacity(candidates.len());
        for pipeline in candidates {
            if !pipeline.trigger_type.is_auto() {
                debug!(pipeline_id = %pipeline.id, "Manual pipeline, webhook skipped");
                continue;
            }
            if !authorize(&pipeline) {
                warn!(pipeline_id = %pipeline.id, triggered_by, "Webhook caller may not deploy pipeline");
                continue;
            }
            allowed.push(pipeline);
        }
        Ok(self
            .trigger_each(&allowed, &artifact, triggered_by, reference_id)
            .await)
    }

    async fn trigger_each(
        &self,
        pipelines: &[Pipeline],
        artifact: &CiArtifact,
        triggered_by: i64,
        reference_id: Option<&str>,
    ) -> Vec<Started> {
        let mut started = Vec::new();
        for pipeline in pipelines {
            let reference = scoped_reference(reference_id, pipeline.id);
            match self
                .trigger_if_auto_stage(pipeline, artifact, None, triggered_by, reference)
                .await
            {
                Ok(Some(s)) => started.push(s),
                Ok(None) => {}
                Err(e) => {
                    warn!(pipeline_id = %pipeline.id, artifact_id = %artifact.id, error = %e, "Automatic trigger failed")
                }
            }
        }
        started
    }

    /// Start the first automatic step of a pipeline: its pre stage when it
    /// has an automatic one, otherwise the deployment when that is automatic.
    pub async fn trigger_if_auto_stage(
        &self,
        pipeline: &Pipeline,
        artifact: &CiArtifact,
        workflow_id: Option<WorkflowId>,
        triggered_by: i64,
        reference_id: Option<String>,
    ) -> Result<Option<Started>> {
        if let Some(reference) = reference_id.as_deref() {
            if self.already_handled(reference).await? {
                return Ok(None);
            }
        }

        let has_pre = self.stages.definition(pipeline, StageType::Pre).await?.is_some();
        if has_pre && pipeline.pre_trigger_type.is_auto() {
            let runner = self
                .stages
                .trigger(&StageRequest {
                    pipeline_id: pipeline.id,
                    artifact_id: artifact.id,
                    stage: StageType::Pre,
                    workflow_id,
                    triggered_by,
                    reference_id,
                    manual: false,
                })
                .await?;
            return Ok(Some(Started::Stage(runner.id)));
        }
        if has_pre || !pipeline.trigger_type.is_auto() {
            debug!(pipeline_id = %pipeline.id, "No automatic step to start");
            return Ok(None);
        }

        let mut request = ValuesOverrideRequest::new(pipeline.id, artifact.id, WorkflowType::Deploy, triggered_by);
        request.cd_workflow_id = workflow_id;
        request.reference_id = reference_id;
        let (runner, _) = self.trigger_deploy(request, false).await?;
        Ok(Some(Started::Deployment(runner)))
    }

    async fn already_handled(&self, reference_id: &str) -> Result<bool> {
        match self.deps.workflows.find_runner_by_reference(reference_id).await? {
            Some(runner) => {
                info!(reference_id, runner_id = %runner.id, "Trigger already handled");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// A user-initiated trigger. Returns the release counter when a
    /// deployment shipped synchronously.
    pub async fn manual_cd_trigger(&self, request: ValuesOverrideRequest) -> Result<Option<i64>> {
        let pipeline = self.deps.pipelines.get(request.pipeline_id).await?;
        info!(
            pipeline_id = %pipeline.id,
            artifact_id = %request.ci_artifact_id,
            workflow_type = %request.cd_workflow_type,
            triggered_by = request.triggered_by,
            "Manual trigger"
        );
        match request.cd_workflow_type {
            WorkflowType::Pre => {
                self.stages
                    .trigger(&StageRequest {
                        pipeline_id: pipeline.id,
                        artifact_id: request.ci_artifact_id,
                        stage: StageType::Pre,
                        workflow_id: request.cd_workflow_id,
                        triggered_by: request.triggered_by,
                        reference_id: request.reference_id.clone(),
                        manual: true,
                    })
                    .await?;
                Ok(None)
            }
            WorkflowType::Post => {
                let workflow_id = match request.cd_workflow_id {
                    Some(id) => Some(id),
                    None => self
                        .deps
                        .workflows
                        .latest_deploy_runner(pipeline.id)
                        .await?
                        .map(|r| r.workflow_id),
                };
                self.stages
                    .trigger(&StageRequest {
                        pipeline_id: pipeline.id,
                        artifact_id: request.ci_artifact_id,
                        stage: StageType::Post,
                        workflow_id,
                        triggered_by: request.triggered_by,
                        reference_id: request.reference_id.clone(),
                        manual: true,
                    })
                    .await?;
                Ok(None)
            }
            WorkflowType::Deploy => {
                let (_, counter) = self.trigger_deploy(request, true).await?;
                Ok(counter)
            }
        }
    }

    /// Create a validated deploy runner for `request` and release it.
    ///
    /// Approval and filter refusals happen before any row is written. A
    /// vulnerable image fails the freshly created runner. In async mode Helm
    /// releases are queued and no counter is returned.
    pub async fn trigger_deploy(
        &self,
        mut request: ValuesOverrideRequest,
        manual: bool,
    ) -> Result<(RunnerId, Option<i64>)> {
        let pipeline = self.deps.pipelines.get(request.pipeline_id).await?;
        let artifact = self.deps.artifacts.get(request.ci_artifact_id).await?;
        let hibernate = request.deployment_type.is_hibernate_request();

        if !hibernate {
            self.gates.check_approval(&pipeline, artifact.id).await?;
            if manual {
                let evaluation = self.gates.evaluate_filters(&pipeline, &artifact).await?;
                if !evaluation.allowed {
                    return Err(Error::Blocked(FILTER_BLOCKED_MESSAGE.to_string()));
                }
            }
        }

        let workflow_id = match request.cd_workflow_id {
            Some(id) => id,
            None => {
                self.deps
                    .workflows
                    .create_workflow(pipeline.id, artifact.id, None)
                    .await?
                    .id
            }
        };
        let runner = self
            .deps
            .workflows
            .create_runner(NewRunner::deploy(
                workflow_id,
                pipeline.id,
                pipeline.name.clone(),
                pipeline.namespace.clone(),
                request.triggered_by,
                request.reference_id.clone(),
            ))
            .await?;
        info!(runner_id = %runner.id, pipeline_id = %pipeline.id, workflow_id = %workflow_id, "Deploy runner created");

        if !hibernate && self.gates.is_vulnerable(&pipeline, &artifact).await? {
            self.recorder.fail_vulnerable(runner.id, &artifact.image_digest).await?;
            self.notify(&pipeline, &runner, NotificationKind::Blocked).await;
            return Err(Error::Blocked(format!(
                "found vulnerability for image digest {}",
                artifact.image_digest
            )));
        }

        self.recorder
            .append_timeline(runner.id, TimelineStatus::DeploymentInitiated, DESCRIPTION_DEPLOYMENT_INITIATED)
            .await?;
        self.recorder
            .append_timeline(runner.id, TimelineStatus::DeploymentRequestValidated, DESCRIPTION_REQUEST_VALIDATED)
            .await?;
        self.notify(&pipeline, &runner, NotificationKind::Trigger).await;

        request.wfr_id = Some(runner.id);
        request.cd_workflow_id = Some(workflow_id);
        request.app_id = pipeline.app_id;
        request.env_id = pipeline.env_id;

        if self.deps.config.async_helm_install
            && pipeline.deployment_app_type == deckhand_core::pipeline::DeploymentAppType::Helm
        {
            self.enqueue_async(&runner, request).await?;
            return Ok((runner.id, None));
        }
        let counter = self.coordinator.execute(&request).await?;
        Ok((runner.id, counter))
    }

    async fn enqueue_async(&self, runner: &CdWorkflowRunner, request: ValuesOverrideRequest) -> Result<()> {
        self.recorder
            .set_runner_status(runner.id, RunnerStatus::Queued, "")
            .await?;
        let event = AsyncCdDeployEvent {
            triggered_at: Utc::now(),
            triggered_by: request.triggered_by,
            values_override_request: request,
        };
        if let Err(e) = publish_json(self.deps.bus.as_ref(), topics::ASYNC_CHART_INSTALL, &event).await {
            error!(runner_id = %runner.id, error = %e, "Failed to queue release");
            self.recorder
                .record_outcome(runner.id, &DeploymentOutcome::FailedWith(e.runner_message()))
                .await?;
            return Err(e);
        }
        info!(runner_id = %runner.id, "Release queued");
        Ok(())
    }

    /// Continue a pipeline after a stage finished successfully.
    ///
    /// A pre stage is followed by the deployment when that is automatic,
    /// using the newest image the stage's plugins produced. A post stage
    /// hands over to the child pipelines.
    pub async fn handle_stage_complete(
        &self,
        event: &CdStageCompleteEvent,
        reference_id: Option<&str>,
    ) -> Result<Option<Started>> {
        let runner = self.deps.workflows.get_runner(event.workflow_runner_id).await?;
        let pipeline = self.deps.pipelines.get(event.cd_pipeline_id).await?;
        let parent = self.deps.artifacts.get(event.ci_artifact_id).await?;
        let stage = match runner.workflow_type {
            WorkflowType::Pre => StageType::Pre,
            WorkflowType::Post => StageType::Post,
            WorkflowType::Deploy => {
                return Err(Error::InvalidInput(format!(
                    "runner {} is a deployment, not a stage",
                    runner.id
                )));
            }
        };

        let produced = self
            .stages
            .persist_plugin_artifacts(&pipeline, stage, &parent, &event.plugin_registry_artifact_details)
            .await?;
        let artifact = produced.unwrap_or(parent);

        match stage {
            StageType::Pre => {
                if !pipeline.trigger_type.is_auto() {
                    info!(pipeline_id = %pipeline.id, "Pre stage done, deployment is manual");
                    return Ok(None);
                }
                let reference = scoped_reference(reference_id, pipeline.id);
                if let Some(r) = reference.as_deref() {
                    if self.already_handled(r).await? {
                        return Ok(None);
                    }
                }
                let mut request = ValuesOverrideRequest::new(pipeline.id, artifact.id, WorkflowType::Deploy, event.triggered_by);
                request.cd_workflow_id = Some(runner.workflow_id);
                request.reference_id = reference;
                let (deployed, _) = self.trigger_deploy(request, false).await?;
                Ok(Some(Started::Deployment(deployed)))
            }
            StageType::Post => {
                self.trigger_children(&pipeline, &artifact, event.triggered_by, reference_id)
                    .await;
                Ok(None)
            }
        }
    }

    /// Continue a pipeline whose deployment succeeded: its automatic post
    /// stage, or else its child pipelines.
    pub async fn handle_deploy_success(&self, runner: &CdWorkflowRunner) -> Result<Option<Started>> {
        let pipeline = self.deps.pipelines.get(runner.pipeline_id).await?;
        let workflow = self.deps.workflows.get_workflow(runner.workflow_id).await?;
        let artifact = self.deps.artifacts.get(workflow.ci_artifact_id).await?;

        let has_post = self.stages.definition(&pipeline, StageType::Post).await?.is_some();
        if has_post && pipeline.post_trigger_type.is_auto() {
            let post = self
                .stages
                .trigger(&StageRequest {
                    pipeline_id: pipeline.id,
                    artifact_id: artifact.id,
                    stage: StageType::Post,
                    workflow_id: Some(workflow.id),
                    triggered_by: runner.triggered_by,
                    reference_id: None,
                    manual: false,
                })
                .await?;
            return Ok(Some(Started::Stage(post.id)));
        }
        if !has_post {
            let reference = format!("deploy-{}", runner.id);
            self.trigger_children(&pipeline, &artifact, runner.triggered_by, Some(&reference))
                .await;
        }
        Ok(None)
    }

    async fn trigger_children(
        &self,
        pipeline: &Pipeline,
        artifact: &CiArtifact,
        triggered_by: i64,
        reference_id: Option<&str>,
    ) -> Vec<Started> {
        let children = match self.deps.pipelines.find_children(pipeline.id).await {
            Ok(children) => children,
            Err(e) => {
                warn!(pipeline_id = %pipeline.id, error = %e, "Failed to load child pipelines");
                return Vec::new();
            }
        };
        if !children.is_empty() {
            info!(pipeline_id = %pipeline.id, children = children.len(), "Triggering child pipelines");
        }
        self.trigger_each(&children, artifact, triggered_by, reference_id)
            .await
    }

    pub async fn handle_pipeline_deleted(&self, event: &PipelineDeletedEvent) -> Result<Option<RunnerId>> {
        info!(pipeline_id = %event.pipeline_id, deleted_by = event.deleted_by, "Pipeline deleted");
        self.coordinator.remove_pipeline(event.pipeline_id).await
    }

    /// Accept bulk deploy requests: each gets a workflow row that tracks the
    /// request through the queue.
    pub async fn trigger_bulk_deployment_async(
        &self,
        requests: Vec<BulkTriggerRequest>,
    ) -> Result<Vec<WorkflowId>> {
        let mut accepted = Vec::with_capacity(requests.len());
        for mut request in requests {
            let workflow = self
                .deps
                .workflows
                .create_workflow(request.pipeline_id, request.ci_artifact_id, Some(WorkflowStatus::Accepted))
                .await?;
            request.cd_workflow_id = Some(workflow.id);
            self.enqueue_bulk(workflow.id, topics::BULK_DEPLOY, &request).await?;
            accepted.push(workflow.id);
        }
        Ok(accepted)
    }

    /// Accept bulk hibernate or wake requests. Pipelines that never deployed
    /// have nothing to hibernate and are skipped.
    pub async fn trigger_bulk_hibernate_async(
        &self,
        requests: Vec<DeploymentGroupAppWithEnv>,
    ) -> Result<Vec<WorkflowId>> {
        let mut accepted = Vec::with_capacity(requests.len());
        for mut request in requests {
            let Some(last) = self.deps.workflows.latest_deploy_runner(request.pipeline_id).await? else {
                warn!(pipeline_id = %request.pipeline_id, "Pipeline never deployed, hibernate skipped");
                continue;
            };
            let deployed = self.deps.workflows.get_workflow(last.workflow_id).await?;
            let workflow = self
                .deps
                .workflows
                .create_workflow(request.pipeline_id, deployed.ci_artifact_id, Some(WorkflowStatus::Accepted))
                .await?;
            request.cd_workflow_id = Some(workflow.id);
            self.enqueue_bulk(workflow.id, topics::BULK_HIBERNATE, &request).await?;
            accepted.push(workflow.id);
        }
        Ok(accepted)
    }

    async fn enqueue_bulk<T: serde::Serialize + Sync>(
        &self,
        workflow_id: WorkflowId,
        topic: &str,
        payload: &T,
    ) -> Result<()> {
        match publish_json(self.deps.bus.as_ref(), topic, payload).await {
            Ok(message_id) => {
                debug!(workflow_id = %workflow_id, message_id, topic, "Bulk request enqueued");
                self.deps
                    .workflows
                    .update_workflow_status(workflow_id, WorkflowStatus::Enqueued)
                    .await?;
                Ok(())
            }
            Err(e) => {
                error!(workflow_id = %workflow_id, topic, error = %e, "Failed to enqueue bulk request");
                self.deps
                    .workflows
                    .update_workflow_status(workflow_id, WorkflowStatus::QueError)
                    .await?;
                Err(e)
            }
        }
    }

    /// Whether `workflow_id` is still the newest request for its pipeline.
    /// Stale requests are marked dropped.
    async fn still_latest(&self, pipeline_id: PipelineId, workflow_id: WorkflowId) -> Result<bool> {
        let latest = self.deps.workflows.latest_workflow_id(pipeline_id).await?;
        if latest == Some(workflow_id) {
            return Ok(true);
        }
        info!(
            pipeline_id = %pipeline_id,
            workflow_id = %workflow_id,
            latest = ?latest.map(|w| w.get()),
            "Dropping stale bulk request"
        );
        self.deps
            .workflows
            .update_workflow_status(workflow_id, WorkflowStatus::DroppedStale)
            .await?;
        Ok(false)
    }

    /// Run one dequeued bulk deploy request through the standard trigger
    /// path. The request's workflow row records how it ended.
    pub async fn handle_bulk_deploy(&self, request: &BulkTriggerRequest, reference_id: Option<&str>) -> Result<()> {
        let workflow_id = request.cd_workflow_id.ok_or_else(|| {
            Error::InvalidInput("bulk deploy request has no workflow".to_string())
        })?;
        if !self.still_latest(request.pipeline_id, workflow_id).await? {
            return Ok(());
        }
        let result = async {
            let pipeline = self.deps.pipelines.get(request.pipeline_id).await?;
            let reference = reference_id.map(str::to_string);
            let has_pre = self.stages.definition(&pipeline, StageType::Pre).await?.is_some();
            if has_pre {
                self.stages
                    .trigger(&StageRequest {
                        pipeline_id: pipeline.id,
                        artifact_id: request.ci_artifact_id,
                        stage: StageType::Pre,
                        workflow_id: Some(workflow_id),
                        triggered_by: request.triggered_by,
                        reference_id: reference,
                        manual: false,
                    })
                    .await?;
            } else {
                let mut deploy =
                    ValuesOverrideRequest::new(pipeline.id, request.ci_artifact_id, WorkflowType::Deploy, request.triggered_by);
                deploy.cd_workflow_id = Some(workflow_id);
                deploy.reference_id = reference;
                self.trigger_deploy(deploy, false).await?;
            }
            Ok::<_, Error>(())
        }
        .await;
        self.finish_bulk(workflow_id, result).await
    }

    pub async fn handle_bulk_hibernate(
        &self,
        request: &DeploymentGroupAppWithEnv,
        reference_id: Option<&str>,
    ) -> Result<()> {
        let workflow_id = request.cd_workflow_id.ok_or_else(|| {
            Error::InvalidInput("bulk hibernate request has no workflow".to_string())
        })?;
        if !self.still_latest(request.pipeline_id, workflow_id).await? {
            return Ok(());
        }
        let result = async {
            let workflow = self.deps.workflows.get_workflow(workflow_id).await?;
            let mut deploy = ValuesOverrideRequest::new(
                request.pipeline_id,
                workflow.ci_artifact_id,
                WorkflowType::Deploy,
                request.user_id,
            );
            deploy.deployment_type = match request.request_type {
                DeploymentType::Stop => DeploymentType::Stop,
                _ => DeploymentType::Start,
            };
            deploy.cd_workflow_id = Some(workflow_id);
            deploy.reference_id = reference_id.map(str::to_string);
            self.trigger_deploy(deploy, false).await.map(|_| ())
        }
        .await;
        self.finish_bulk(workflow_id, result).await
    }

    async fn finish_bulk(&self, workflow_id: WorkflowId, result: Result<()>) -> Result<()> {
        let status = match &result {
            Ok(()) => WorkflowStatus::WfStarted,
            Err(e) => {
                warn!(workflow_id = %workflow_id, error = %e, "Bulk request failed");
                WorkflowStatus::TriggerError
            }
        };
        self.deps.workflows.update_workflow_status(workflow_id, status).await?;
        Ok(())
    }

    async fn notify(&self, pipeline: &Pipeline, runner: &CdWorkflowRunner, kind: NotificationKind) {
        let event = NotificationEvent {
            kind,
            pipeline_id: pipeline.id,
            app_id: pipeline.app_id,
            env_id: pipeline.env_id,
            runner_id: runner.id,
            workflow_type: runner.workflow_type,
            triggered_by: runner.triggered_by,
            message: None,
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
    use crate::testing::Harness;
    use deckhand_config::CdConfig;
    use deckhand_core::pipeline::{ApprovalConfig, TriggerType};
    use deckhand_core::services::NotificationKind;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_ci_success_deploys_automatic_pipeline() {
        let h = Harness::new();
        h.seed_pipeline(10);
        h.seed_artifact(42, "r.io/a:v1");

        let started = h.orchestrator().handle_ci_success(ArtifactId(42), 1, Some("m-1")).await.unwrap();
        let [Started::Deployment(runner)] = started.as_slice() else {
            panic!("expected one deployment, got {started:?}");
        };
        assert_eq!(h.store.runner(*runner).status, RunnerStatus::InProgress);
        assert_eq!(h.helm.installs().len(), 1);
        assert_eq!(
            h.store.runner(*runner).reference_id.as_deref(),
            Some("m-1:10")
        );
        assert!(
            h.services
                .notifications()
                .iter()
                .any(|n| n.kind == NotificationKind::Trigger && n.runner_id == *runner)
        );
    }

    #[tokio::test]
    async fn test_redelivered_ci_event_starts_nothing_new() {
        let h = Harness::new();
        h.seed_pipeline(10);
        h.seed_artifact(42, "r.io/a:v1");
        let orchestrator = h.orchestrator();

        orchestrator.handle_ci_success(ArtifactId(42), 1, Some("m-1")).await.unwrap();
        let again = orchestrator.handle_ci_success(ArtifactId(42), 1, Some("m-1")).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(h.store.deploy_runners(PipelineId(10)).len(), 1);
        assert_eq!(h.helm.installs().len(), 1);
    }

    #[tokio::test]
    async fn test_ci_success_fans_out_and_isolates_failures() {
        let h = Harness::new();
        h.seed_pipeline(10);
        let mut approval = h.seed_pipeline(11);
        approval.approval = Some(ApprovalConfig { required_approvals: 1 });
        h.store.put_pipeline(approval);
        let mut manual = h.seed_pipeline(12);
        manual.trigger_type = TriggerType::Manual;
        h.store.put_pipeline(manual);
        h.seed_artifact(42, "r.io/a:v1");

        let started = h.orchestrator().handle_ci_success(ArtifactId(42), 1, None).await.unwrap();
        assert_eq!(started.len(), 1);
        assert!(h.store.deploy_runners(PipelineId(11)).is_empty());
        assert!(h.store.deploy_runners(PipelineId(12)).is_empty());
    }

    #[tokio::test]
    async fn test_automatic_pre_stage_runs_before_deployment() {
        let h = Harness::new();
        let mut p = h.seed_pipeline(10);
        p.pre_stage_yaml = Some("version: 0.0.1".to_string());
        h.store.put_pipeline(p);
        h.seed_artifact(42, "r.io/a:v1");

        let started = h.orchestrator().handle_ci_success(ArtifactId(42), 1, None).await.unwrap();
        assert!(matches!(started.as_slice(), [Started::Stage(_)]));
        assert_eq!(h.executor.submissions().len(), 1);
        assert!(h.store.deploy_runners(PipelineId(10)).is_empty());
    }

    #[tokio::test]
    async fn test_pre_stage_completion_deploys_plugin_image_in_same_workflow() {
        let h = Harness::new();
        let mut p = h.seed_pipeline(10);
        p.pre_stage_yaml = Some("version: 0.0.1".to_string());
        h.store.put_pipeline(p);
        h.seed_artifact(42, "r.io/a:v1");
        let orchestrator = h.orchestrator();
        let started = orchestrator.handle_ci_success(ArtifactId(42), 1, None).await.unwrap();
        let [Started::Stage(pre)] = started.as_slice() else {
            panic!("expected pre stage, got {started:?}");
        };
        h.store.complete_runner(*pre);
        let pre = h.store.runner(*pre);

        let event = CdStageCompleteEvent {
            workflow_id: pre.workflow_id,
            workflow_runner_id: pre.id,
            cd_pipeline_id: PipelineId(10),
            triggered_by: 1,
            ci_artifact_id: ArtifactId(42),
            plugin_registry_artifact_details: BTreeMap::from([(
                "dest".to_string(),
                vec!["r.io/mirror:v1".to_string()],
            )]),
        };
        let started = orchestrator.handle_stage_complete(&event, Some("m-2")).await.unwrap();
        let Some(Started::Deployment(deploy)) = started else {
            panic!("expected deployment");
        };
        let deploy = h.store.runner(deploy);
        assert_eq!(deploy.workflow_id, pre.workflow_id);
        let release = h.store.override_for(deploy.id).unwrap();
        assert_ne!(release.ci_artifact_id, ArtifactId(42));
    }

    #[tokio::test]
    async fn test_vulnerable_image_fails_runner_before_release() {
        let h = Harness::new();
        h.seed_pipeline(10);
        let mut a = h.seed_artifact(42, "r.io/a:v1");
        a.image_digest = "sha256:bad".to_string();
        h.store.put_artifact(a);
        h.services.scan("sha256:bad", &["CVE-2024-1"]);
        h.services.block_cve(5, "CVE-2024-1");

        let request = ValuesOverrideRequest::new(PipelineId(10), ArtifactId(42), WorkflowType::Deploy, 1);
        let err = h.orchestrator().manual_cd_trigger(request).await.unwrap_err();
        assert!(matches!(err, Error::Blocked(_)));
        assert_eq!(err.to_string(), "found vulnerability for image digest sha256:bad");

        let runners = h.store.deploy_runners(PipelineId(10));
        assert_eq!(runners.len(), 1);
        assert_eq!(runners[0].status, RunnerStatus::Failed);
        assert_eq!(runners[0].message, "found vulnerability for image digest sha256:bad");
        assert!(h.store.override_for(runners[0].id).is_none());
        assert!(h.helm.installs().is_empty());
        let last = h.store.timeline(runners[0].id).pop().unwrap();
        assert_eq!(last.status, TimelineStatus::DeploymentFailed);
        assert_eq!(
            last.status_detail,
            deckhand_core::timeline::DESCRIPTION_VULNERABLE_IMAGE
        );
    }

    #[tokio::test]
    async fn test_artifact_without_digest_skips_vulnerability_gate() {
        let h = Harness::new();
        h.seed_pipeline(10);
        let mut a = h.seed_artifact(42, "r.io/a:v1");
        a.image_digest = String::new();
        h.store.put_artifact(a);
        h.services.scan("", &["CVE-2024-1"]);
        h.services.block_cve(5, "CVE-2024-1");

        let request = ValuesOverrideRequest::new(PipelineId(10), ArtifactId(42), WorkflowType::Deploy, 1);
        let counter = h.orchestrator().manual_cd_trigger(request).await.unwrap();
        assert_eq!(counter, Some(1));
        let runners = h.store.deploy_runners(PipelineId(10));
        assert_ne!(runners[0].status, RunnerStatus::Failed);
        assert_eq!(h.helm.installs().len(), 1);
    }

    #[tokio::test]
    async fn test_unapproved_artifact_creates_no_runner() {
        let h = Harness::new();
        let mut p = h.seed_pipeline(10);
        p.approval = Some(ApprovalConfig { required_approvals: 1 });
        h.store.put_pipeline(p);
        h.seed_artifact(42, "r.io/a:v1");

        let request = ValuesOverrideRequest::new(PipelineId(10), ArtifactId(42), WorkflowType::Deploy, 1);
        let err = h.orchestrator().manual_cd_trigger(request.clone()).await.unwrap_err();
        assert!(matches!(err, Error::Blocked(_)));
        assert!(h.store.deploy_runners(PipelineId(10)).is_empty());

        h.services.approve(PipelineId(10), ArtifactId(42));
        let counter = h.orchestrator().manual_cd_trigger(request).await.unwrap();
        assert_eq!(counter, Some(1));
    }

    #[tokio::test]
    async fn test_manual_deploy_returns_increasing_counters() {
        let h = Harness::new();
        h.seed_pipeline(10);
        h.seed_artifact(42, "r.io/a:v1");
        let orchestrator = h.orchestrator();
        let request = ValuesOverrideRequest::new(PipelineId(10), ArtifactId(42), WorkflowType::Deploy, 1);

        assert_eq!(orchestrator.manual_cd_trigger(request.clone()).await.unwrap(), Some(1));
        assert_eq!(orchestrator.manual_cd_trigger(request).await.unwrap(), Some(2));
        let runners = h.store.deploy_runners(PipelineId(10));
        assert_eq!(runners[0].status, RunnerStatus::Failed);
        assert_eq!(runners[1].status, RunnerStatus::InProgress);
    }

    #[tokio::test]
    async fn test_async_mode_queues_helm_release() {
        let mut config = CdConfig::default();
        config.async_helm_install = true;
        let h = Harness::with_config(config);
        h.seed_pipeline(10);
        h.seed_artifact(42, "r.io/a:v1");

        let request = ValuesOverrideRequest::new(PipelineId(10), ArtifactId(42), WorkflowType::Deploy, 1);
        assert_eq!(h.orchestrator().manual_cd_trigger(request).await.unwrap(), None);

        let runners = h.store.deploy_runners(PipelineId(10));
        assert_eq!(runners[0].status, RunnerStatus::Queued);
        assert!(h.helm.installs().is_empty());
        let published = h.bus.published(topics::ASYNC_CHART_INSTALL);
        assert_eq!(published.len(), 1);
        assert_eq!(
            published[0]["valuesOverrideRequest"]["wfr_id"],
            runners[0].id.get()
        );
    }

    #[tokio::test]
    async fn test_deploy_success_triggers_children_without_post_stage() {
        let h = Harness::new();
        h.seed_pipeline(10);
        let mut child = h.seed_pipeline(20);
        child.parent_pipeline_id = Some(PipelineId(10));
        child.ci_pipeline_id = 0;
        h.store.put_pipeline(child);
        h.seed_artifact(42, "r.io/a:v1");
        let orchestrator = h.orchestrator();

        let request = ValuesOverrideRequest::new(PipelineId(10), ArtifactId(42), WorkflowType::Deploy, 1);
        orchestrator.manual_cd_trigger(request).await.unwrap();
        let parent_runner = h.store.deploy_runners(PipelineId(10)).remove(0);
        h.store.complete_runner(parent_runner.id);

        orchestrator.handle_deploy_success(&h.store.runner(parent_runner.id)).await.unwrap();
        assert_eq!(h.store.deploy_runners(PipelineId(20)).len(), 1);
    }

    #[tokio::test]
    async fn test_deploy_success_runs_automatic_post_stage() {
        let h = Harness::new();
        let mut p = h.seed_pipeline(10);
        p.post_stage_yaml = Some("version: 0.0.1".to_string());
        p.post_trigger_type = TriggerType::Automatic;
        h.store.put_pipeline(p);
        h.seed_artifact(42, "r.io/a:v1");
        let orchestrator = h.orchestrator();

        let request = ValuesOverrideRequest::new(PipelineId(10), ArtifactId(42), WorkflowType::Deploy, 1);
        orchestrator.manual_cd_trigger(request).await.unwrap();
        let deploy = h.store.deploy_runners(PipelineId(10)).remove(0);

        let started = orchestrator.handle_deploy_success(&deploy).await.unwrap();
        let Some(Started::Stage(post)) = started else {
            panic!("expected post stage");
        };
        let post = h.store.runner(post);
        assert_eq!(post.workflow_id, deploy.workflow_id);
        assert_eq!(post.ref_runner_id, Some(deploy.id));
        let submitted = h.executor.submissions();
        assert_eq!(
            submitted[0].deploy_info.as_ref().and_then(|d| d.release_counter),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_bulk_deploy_drops_stale_requests() {
        let h = Harness::new();
        h.seed_pipeline(10);
        h.seed_artifact(42, "r.io/a:v1");
        h.seed_artifact(43, "r.io/a:v2");
        let orchestrator = h.orchestrator();

        let request = |artifact| BulkTriggerRequest {
            ci_artifact_id: ArtifactId(artifact),
            pipeline_id: PipelineId(10),
            cd_workflow_id: None,
            triggered_by: 1,
        };
        let accepted = orchestrator
            .trigger_bulk_deployment_async(vec![request(42), request(43)])
            .await
            .unwrap();
        assert_eq!(accepted.len(), 2);
        for id in &accepted {
            assert_eq!(h.store.workflow(*id).workflow_status, Some(WorkflowStatus::Enqueued));
        }

        let published = h.bus.published(topics::BULK_DEPLOY);
        for payload in published {
            let queued: BulkTriggerRequest = serde_json::from_value(payload).unwrap();
            orchestrator.handle_bulk_deploy(&queued, None).await.unwrap();
        }
        assert_eq!(h.store.workflow(accepted[0]).workflow_status, Some(WorkflowStatus::DroppedStale));
        assert_eq!(h.store.workflow(accepted[1]).workflow_status, Some(WorkflowStatus::WfStarted));
        assert_eq!(h.helm.installs().len(), 1);
    }

    #[tokio::test]
    async fn test_bulk_trigger_error_is_recorded() {
        let h = Harness::new();
        let mut p = h.seed_pipeline(10);
        p.approval = Some(ApprovalConfig { required_approvals: 1 });
        h.store.put_pipeline(p);
        h.seed_artifact(42, "r.io/a:v1");
        let orchestrator = h.orchestrator();

        let accepted = orchestrator
            .trigger_bulk_deployment_async(vec![BulkTriggerRequest {
                ci_artifact_id: ArtifactId(42),
                pipeline_id: PipelineId(10),
                cd_workflow_id: None,
                triggered_by: 1,
            }])
            .await
            .unwrap();
        let queued: BulkTriggerRequest =
            serde_json::from_value(h.bus.published(topics::BULK_DEPLOY).remove(0)).unwrap();
        orchestrator.handle_bulk_deploy(&queued, None).await.unwrap();
        assert_eq!(h.store.workflow(accepted[0]).workflow_status, Some(WorkflowStatus::TriggerError));
    }

    #[tokio::test]
    async fn test_bulk_hibernate_scales_to_zero() {
        let h = Harness::new();
        h.seed_pipeline(10);
        h.seed_artifact(42, "r.io/a:v1");
        let orchestrator = h.orchestrator();
        let deploy = ValuesOverrideRequest::new(PipelineId(10), ArtifactId(42), WorkflowType::Deploy, 1);
        orchestrator.manual_cd_trigger(deploy).await.unwrap();

        let accepted = orchestrator
            .trigger_bulk_hibernate_async(vec![DeploymentGroupAppWithEnv {
                app_id: 1,
                env_id: 5,
                pipeline_id: PipelineId(10),
                deployment_group_id: 0,
                user_id: 2,
                request_type: DeploymentType::Stop,
                cd_workflow_id: None,
            }])
            .await
            .unwrap();
        let queued: DeploymentGroupAppWithEnv =
            serde_json::from_value(h.bus.published(topics::BULK_HIBERNATE).remove(0)).unwrap();
        orchestrator.handle_bulk_hibernate(&queued, None).await.unwrap();

        assert_eq!(h.store.workflow(accepted[0]).workflow_status, Some(WorkflowStatus::WfStarted));
        let runners = h.store.deploy_runners(PipelineId(10));
        let release = h.store.override_for(runners[1].id).unwrap();
        assert_eq!(release.deployment_type, DeploymentType::Stop);
        assert_eq!(release.merged_values["replicaCount"], 0);
    }

    #[tokio::test]
    async fn test_webhook_respects_authorization() {
        let h = Harness::new();
        let mut p = h.seed_pipeline(10);
        p.ci_pipeline_id = 0;
        h.store.put_pipeline(p);
        h.store.map_external_ci(77, PipelineId(10));
        h.seed_artifact(42, "r.io/a:v1");
        let orchestrator = h.orchestrator();

        let denied = orchestrator
            .handle_webhook_external_ci(ArtifactId(42), 77, 1, None, &|_| false)
            .await
            .unwrap();
        assert!(denied.is_empty());
        let allowed = orchestrator
            .handle_webhook_external_ci(ArtifactId(42), 77, 1, None, &|p| p.app_id == 1)
            .await
            .unwrap();
        assert_eq!(allowed.len(), 1);
    }
}
