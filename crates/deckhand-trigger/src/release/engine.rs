//! The deploy stage: resolve configuration, allocate the release counter,
//! merge values and ship them through GitOps, Helm or manifest download.

use deckhand_config::{ReleaseTemplate, substitute_variables};
use deckhand_core::artifact::{CiArtifact, split_image};
use deckhand_core::deployer::{HelmAppIdentifier, HelmReleaseRequest, PatchType, ValuesCommit};
use deckhand_core::events::{CdSuccessEvent, publish_json, topics};
use deckhand_core::pipeline::{DeploymentAppType, Pipeline};
use deckhand_core::release::{
    NewOverride, PipelineOverride, ReleaseAttributes, ValuesOverrideRequest,
};
use deckhand_core::services::CdTriggerEvent;
use deckhand_core::timeline::{
    DESCRIPTION_ARGOCD_SYNC_COMPLETED, DESCRIPTION_ARGOCD_SYNC_INITIATED,
    DESCRIPTION_DEPLOYMENT_TRIGGERED, DESCRIPTION_GIT_COMMIT, ReleaseProgress, TimelineStatus,
};
use deckhand_core::workflow::{CdWorkflowRunner, RunnerStatus};
use deckhand_core::{Error, OverrideId, Result};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::autoscaling::AutoscalingReconciler;
use super::config_source::{ConfigSource, ResolvedConfig};
use super::counter::allocate_release;
use super::merge::{MergeInputs, app_labels_json, config_map_secret_json, merge_patch, merge_values};
use crate::deps::Collaborators;
use crate::recorder::StatusRecorder;

pub const REQUEST_NOT_VALIDATED: &str =
    "pre-condition missing: timeline for deployment request validation";

/// What a release attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseReport {
    /// The runner's timeline shows the release already went out.
    AlreadyDone,
    Shipped {
        release_counter: i64,
        override_id: OverrideId,
        app_type: DeploymentAppType,
    },
}

impl ReleaseReport {
    pub fn release_counter(&self) -> Option<i64> {
        match self {
            ReleaseReport::AlreadyDone => None,
            ReleaseReport::Shipped {
                release_counter, ..
            } => Some(*release_counter),
        }
    }
}

/// Everything known about a release once its values are merged.
struct Prepared {
    pipeline: Pipeline,
    artifact: CiArtifact,
    runner: CdWorkflowRunner,
    resolved: ResolvedConfig,
    release: PipelineOverride,
    values_yaml: String,
}

pub struct ReleaseEngine {
    deps: Collaborators,
    recorder: StatusRecorder,
    config_source: ConfigSource,
    autoscaling: AutoscalingReconciler,
}

impl ReleaseEngine {
    pub fn new(deps: &Collaborators) -> Self {
        Self {
            deps: deps.clone(),
            recorder: StatusRecorder::from_collaborators(deps),
            config_source: ConfigSource::new(
                deps.configs.clone(),
                deps.history.clone(),
                deps.variables.clone(),
            ),
            autoscaling: AutoscalingReconciler::new(
                deps.cluster.clone(),
                deps.config.autoscaling.clone(),
            ),
        }
    }

    /// Ship one release for the runner named by `request.wfr_id`.
    ///
    /// The runner's timeline makes this safe to repeat: a release that was
    /// already triggered is skipped, and a git commit or ArgoCD sync that
    /// already happened is not redone.
    pub async fn release(&self, request: &ValuesOverrideRequest) -> Result<ReleaseReport> {
        let runner_id = request.wfr_id.ok_or_else(|| {
            Error::InvalidInput("values override request has no runner".to_string())
        })?;
        let progress = ReleaseProgress::from_entries(&self.recorder.timelines(runner_id).await?);
        if progress.already_done {
            info!(runner_id = %runner_id, "Release already triggered, skipping");
            return Ok(ReleaseReport::AlreadyDone);
        }
        if !progress.request_validated {
            return Err(Error::Blocked(REQUEST_NOT_VALIDATED.to_string()));
        }

        let prepared = self.prepare(request).await?;
        let app_type = prepared.pipeline.deployment_app_type;
        match app_type {
            DeploymentAppType::GitOps => self.ship_gitops(request, &prepared, progress).await?,
            DeploymentAppType::Helm => self.ship_helm(&prepared).await?,
            DeploymentAppType::ManifestDownload => {
                debug!(runner_id = %runner_id, "Manifest download, nothing to apply")
            }
        }

        self.recorder
            .append_timeline(
                runner_id,
                TimelineStatus::DeploymentTriggered,
                DESCRIPTION_DEPLOYMENT_TRIGGERED,
            )
            .await?;
        let status = match app_type {
            DeploymentAppType::ManifestDownload => RunnerStatus::Succeeded,
            _ => RunnerStatus::InProgress,
        };
        self.recorder
            .set_runner_status(runner_id, status, "")
            .await?;

        self.after_ship(&prepared).await?;
        info!(
            pipeline_id = %prepared.pipeline.id,
            runner_id = %runner_id,
            release_counter = prepared.release.pipeline_release_counter,
            app_type = app_type.as_str(),
            "Release shipped"
        );
        Ok(ReleaseReport::Shipped {
            release_counter: prepared.release.pipeline_release_counter,
            override_id: prepared.release.id,
            app_type,
        })
    }

    async fn prepare(&self, request: &ValuesOverrideRequest) -> Result<Prepared> {
        let deps = &self.deps;
        let pipeline = deps.pipelines.get(request.pipeline_id).await?;
        let artifact = deps.artifacts.get(request.ci_artifact_id).await?;
        let runner_id = request.wfr_id.ok_or_else(|| {
            Error::InvalidInput("values override request has no runner".to_string())
        })?;
        let runner = deps.workflows.get_runner(runner_id).await?;
        let deployment_type = request.deployment_type.normalized();

        let resolved = self.config_source.resolve(request, &pipeline).await?;
        let release = allocate_release(
            deps.overrides.as_ref(),
            NewOverride {
                pipeline_id: pipeline.id,
                ci_artifact_id: artifact.id,
                cd_workflow_id: runner.workflow_id,
                env_config_override_id: resolved.env_config_override_id,
                pipeline_release_counter: 0,
                deployment_type,
                created_by: request.triggered_by,
            },
            deps.config.release_counter_retries,
        )
        .await?;

        let attributes = ReleaseAttributes {
            name: split_image(&artifact.image).0.to_string(),
            tag: artifact.image_tag().to_string(),
            pipeline_name: pipeline.name.clone(),
            release_version: release.pipeline_release_counter,
            deployment_type: deployment_type.as_str().to_string(),
            app: pipeline.app_id.to_string(),
            env: pipeline.env_id.to_string(),
            app_metrics: resolved.app_metrics(),
        };
        let mut release_override =
            ReleaseTemplate::new(&attributes).render_json(&resolved.chart.image_descriptor_template)?;
        if let Some(additional) = &request.additional_override {
            merge_patch(&mut release_override, additional);
        }

        let snapshot = &resolved.snapshot;
        let inputs = MergeInputs {
            template: substitute_variables(&snapshot.deployment_template.template, &snapshot.variables),
            strategy: snapshot.strategy.as_ref().map(|s| s.config.clone()),
            db_migration: snapshot.db_migration.clone(),
            release_override: release_override.clone(),
            config_map_secret: substitute_variables(
                &config_map_secret_json(&snapshot.config_maps_secrets, &resolved.chart),
                &snapshot.variables,
            ),
            app_labels: app_labels_json(&snapshot.app_labels),
        };
        let mut merged = merge_values(&inputs);
        self.autoscaling
            .reconcile(&pipeline, deployment_type, &mut merged)
            .await?;
        self.add_pull_secret(&pipeline, &artifact, &mut merged).await?;

        deps.history.save_snapshot(runner.id, snapshot).await?;
        deps.overrides
            .save_values(release.id, &merged, &release_override)
            .await?;
        let values_yaml = serde_yml::to_string(&merged)
            .map_err(|e| Error::Internal(format!("render values yaml: {e}")))?;

        Ok(Prepared {
            pipeline,
            artifact,
            runner,
            resolved,
            release,
            values_yaml,
        })
    }

    async fn add_pull_secret(
        &self,
        pipeline: &Pipeline,
        artifact: &CiArtifact,
        values: &mut Value,
    ) -> Result<()> {
        let Some(registry) = artifact.credentials_source.as_deref() else {
            return Ok(());
        };
        let Some(secret) = self
            .deps
            .registries
            .image_pull_secret(registry, pipeline.env_id)
            .await?
        else {
            return Ok(());
        };
        let entry = json!({ "name": secret });
        match values.get_mut("imagePullSecrets") {
            Some(Value::Array(secrets)) => {
                if !secrets.contains(&entry) {
                    secrets.push(entry);
                }
            }
            _ => merge_patch(values, &json!({ "imagePullSecrets": [entry] })),
        }
        Ok(())
    }

    async fn ship_gitops(
        &self,
        request: &ValuesOverrideRequest,
        prepared: &Prepared,
        progress: ReleaseProgress,
    ) -> Result<()> {
        let deps = &self.deps;
        let settings = &deps.config.gitops;
        let pipeline = &prepared.pipeline;
        let chart = &prepared.resolved.chart;
        let runner_id = prepared.runner.id;

        if progress.git_committed {
            debug!(runner_id = %runner_id, "Values already committed");
        } else {
            let author_email = request
                .user_email
                .clone()
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| settings.commit_author_fallback.clone());
            let author_name = author_email
                .split('@')
                .next()
                .unwrap_or_default()
                .to_string();
            let commit = ValuesCommit {
                repo_url: chart.git_repo_url.clone(),
                chart_location: chart.chart_location.clone(),
                file_name: format!("{}{}-values.yaml", settings.values_file_prefix, pipeline.env_id),
                values_yaml: prepared.values_yaml.clone(),
                author_name,
                author_email,
                message: format!(
                    "release-{}-env-{}",
                    prepared.release.pipeline_release_counter, pipeline.env_id
                ),
            };
            let info = match deps.gitops.commit_values(&commit).await {
                Ok(info) => info,
                Err(e) => {
                    self.recorder
                        .append_timeline(runner_id, TimelineStatus::GitCommitFailed, &e.to_string())
                        .await?;
                    return Err(e);
                }
            };
            deps.overrides.save_commit(prepared.release.id, &info).await?;
            self.recorder
                .append_timeline(runner_id, TimelineStatus::GitCommit, DESCRIPTION_GIT_COMMIT)
                .await?;
            info!(pipeline_id = %pipeline.id, commit = %info.hash, "Values committed");
        }

        let app_name = pipeline.app_release_name();
        let app = deps
            .argocd
            .get(&app_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("argocd application {app_name}")))?;
        if app.path != chart.chart_location || app.repo_url != chart.git_repo_url {
            let patch = json!({
                "spec": {"source": {
                    "path": chart.chart_location,
                    "repoURL": chart.git_repo_url,
                    "targetRevision": "HEAD",
                }}
            });
            deps.argocd.patch(&app_name, &patch, PatchType::Merge).await?;
            info!(app = %app_name, path = %chart.chart_location, "Patched argocd application source");
        }
        deps.argocd
            .update_sync_mode_if_needed(&app, settings.auto_sync)
            .await?;

        if !settings.auto_sync && !progress.sync_completed {
            self.recorder
                .append_timeline(
                    runner_id,
                    TimelineStatus::ArgocdSyncInitiated,
                    DESCRIPTION_ARGOCD_SYNC_INITIATED,
                )
                .await?;
            deps.argocd.sync(&app_name).await?;
            self.recorder
                .append_timeline(
                    runner_id,
                    TimelineStatus::ArgocdSyncCompleted,
                    DESCRIPTION_ARGOCD_SYNC_COMPLETED,
                )
                .await?;
        }
        if !pipeline.deployment_app_created {
            deps.pipelines
                .set_deployment_app_created(pipeline.id, true)
                .await?;
        }
        Ok(())
    }

    async fn ship_helm(&self, prepared: &Prepared) -> Result<()> {
        let deps = &self.deps;
        let pipeline = &prepared.pipeline;
        let chart = &prepared.resolved.chart;
        let request = HelmReleaseRequest {
            app: HelmAppIdentifier {
                cluster_id: pipeline.cluster_id,
                namespace: pipeline.namespace.clone(),
                release_name: pipeline.app_release_name(),
            },
            chart_name: chart.chart_name.clone(),
            chart_version: chart.chart_version.clone(),
            values_yaml: prepared.values_yaml.clone(),
            chart_content: deps.configs.chart_content(chart.chart_ref_id).await?,
        };

        if pipeline.deployment_app_created {
            return deps.helm.update_application(&request).await;
        }
        let result = deps.helm.install_release_with_custom_chart(&request).await;
        match &result {
            Err(Error::Connection(e)) => {
                warn!(pipeline_id = %pipeline.id, error = %e, "Helm executor unreachable, install not attempted");
            }
            _ => {
                deps.pipelines
                    .set_deployment_app_created(pipeline.id, true)
                    .await?;
            }
        }
        result
    }

    /// Trigger event, scan bookkeeping and the success event. Failures here
    /// do not undo the release.
    async fn after_ship(&self, prepared: &Prepared) -> Result<()> {
        let deps = &self.deps;
        let pipeline = &prepared.pipeline;
        let artifact = &prepared.artifact;
        let release = &prepared.release;
        deps.overrides.mark_success(release.id).await?;

        let trigger_event = CdTriggerEvent {
            pipeline_id: pipeline.id,
            runner_id: prepared.runner.id,
            release_counter: release.pipeline_release_counter,
            pipeline_override_id: release.id,
            ci_artifact_id: artifact.id,
            commit_hashes: artifact.commit_hashes(),
            triggered_by: prepared.runner.triggered_by,
            triggered_at: prepared.runner.started_on,
        };
        if let Err(e) = deps.notifier.write_cd_trigger_event(trigger_event).await {
            warn!(pipeline_id = %pipeline.id, error = %e, "Failed to write CD trigger event");
        }

        let scan = if artifact.scan_enabled {
            deps.scans
                .mark_image_deployed(pipeline.app_id, pipeline.env_id, &artifact.image_digest)
                .await
        } else {
            deps.scans
                .clear_image_deployed(pipeline.app_id, pipeline.env_id)
                .await
        };
        if let Err(e) = scan {
            warn!(pipeline_id = %pipeline.id, error = %e, "Failed to update image scan deploy info");
        }

        let success = CdSuccessEvent {
            application_id: pipeline.app_id,
            environment_id: pipeline.env_id,
            release_id: release.pipeline_release_counter,
            pipeline_override_id: release.id,
            trigger_time: prepared.runner.started_on,
            ci_artifact_id: artifact.id,
            pipeline_materials: artifact.commit_hashes(),
        };
        if let Err(e) = publish_json(deps.bus.as_ref(), topics::CD_SUCCESS, &success).await {
            warn!(pipeline_id = %pipeline.id, error = %e, "Failed to publish CD success event");
        }
        Ok(())
    }
}
