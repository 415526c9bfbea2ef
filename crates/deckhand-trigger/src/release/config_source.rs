//! Where a release's configuration comes from: the last saved state of the
//! pipeline, or the snapshot recorded by an earlier runner.

use chrono::Utc;
use deckhand_config::referenced_variables;
use deckhand_core::history::{ConfigSnapshot, DeploymentTemplateHistory};
use deckhand_core::pipeline::Pipeline;
use deckhand_core::release::{Chart, DeploymentWithConfig, ValuesOverrideRequest};
use deckhand_core::services::{ScopedVariableResolver, VariableScope};
use deckhand_core::{Error, Result, RunnerId};
use deckhand_db::{ConfigRepo, HistoryRepo};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Configuration resolved for one release.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub chart: Chart,
    pub env_config_override_id: i64,
    /// Everything the merge reads, recorded against the releasing runner.
    pub snapshot: ConfigSnapshot,
}

impl ResolvedConfig {
    pub fn app_metrics(&self) -> bool {
        self.snapshot.deployment_template.is_app_metrics_enabled
    }
}

pub struct ConfigSource {
    configs: Arc<dyn ConfigRepo>,
    history: Arc<dyn HistoryRepo>,
    variables: Arc<dyn ScopedVariableResolver>,
}

impl ConfigSource {
    pub fn new(
        configs: Arc<dyn ConfigRepo>,
        history: Arc<dyn HistoryRepo>,
        variables: Arc<dyn ScopedVariableResolver>,
    ) -> Self {
        Self {
            configs,
            history,
            variables,
        }
    }

    pub async fn resolve(
        &self,
        request: &ValuesOverrideRequest,
        pipeline: &Pipeline,
    ) -> Result<ResolvedConfig> {
        match request.deployment_with_config {
            DeploymentWithConfig::LastSaved => self.last_saved(pipeline, request.triggered_by).await,
            DeploymentWithConfig::SpecificTrigger => {
                let runner = request.wfr_id_for_deployment_with_specific_trigger.ok_or_else(|| {
                    Error::InvalidInput(
                        "deployment with specific trigger requires a runner id".to_string(),
                    )
                })?;
                self.specific_trigger(pipeline, runner, request.triggered_by)
                    .await
            }
        }
    }

    /// Configuration in effect for a pre/post stage run, with the variables
    /// the stage itself resolved.
    pub async fn stage_snapshot(
        &self,
        pipeline: &Pipeline,
        triggered_by: i64,
        stage_variables: &BTreeMap<String, String>,
    ) -> Result<ConfigSnapshot> {
        let mut snapshot = self.last_saved(pipeline, triggered_by).await?.snapshot;
        snapshot
            .variables
            .extend(stage_variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(snapshot)
    }

    async fn last_saved(&self, pipeline: &Pipeline, triggered_by: i64) -> Result<ResolvedConfig> {
        let chart = self.configs.chart(pipeline.app_id).await?;
        let env_override = match self
            .configs
            .active_env_override(chart.id, pipeline.env_id)
            .await?
        {
            Some(o) => o,
            None => {
                info!(pipeline_id = %pipeline.id, chart_id = chart.id, "Creating empty env override");
                self.configs
                    .create_env_override(&chart, pipeline.env_id, triggered_by)
                    .await?
            }
        };
        let template = if env_override.is_override {
            env_override.env_override_values.clone()
        } else {
            chart.global_override.clone()
        };

        let config_maps_secrets = self
            .configs
            .config_maps_secrets(pipeline.app_id, pipeline.env_id)
            .await?;
        let strategy = self.configs.strategy(pipeline.id).await?;
        let db_migration = self.configs.db_migration_override(pipeline.id).await?;
        let app_labels = self.configs.app_labels(pipeline.app_id).await?;

        let mut names = referenced_variables(&template);
        names.extend(referenced_variables(&bundle_json(&config_maps_secrets)?));
        let variables = self.resolve_variables(pipeline, names).await?;

        let snapshot = ConfigSnapshot {
            deployment_template: DeploymentTemplateHistory {
                pipeline_id: pipeline.id,
                template,
                is_env_override: env_override.is_override,
                env_config_override_id: env_override.id,
                chart_ref_id: chart.chart_ref_id,
                chart_version: chart.chart_version.clone(),
                image_descriptor_template: chart.image_descriptor_template.clone(),
                is_app_metrics_enabled: env_override
                    .is_app_metrics_enabled
                    .unwrap_or(chart.is_app_metrics_enabled),
                deployed_on: Utc::now(),
                deployed_by: triggered_by,
            },
            config_maps_secrets,
            strategy,
            db_migration,
            app_labels,
            variables,
        };
        Ok(ResolvedConfig {
            chart,
            env_config_override_id: env_override.id,
            snapshot,
        })
    }

    /// Rebuild the configuration of `runner`'s release. Recorded variable
    /// values win; variables the snapshot lacks are resolved now.
    async fn specific_trigger(
        &self,
        pipeline: &Pipeline,
        runner: RunnerId,
        triggered_by: i64,
    ) -> Result<ResolvedConfig> {
        let mut snapshot = self
            .history
            .snapshot(runner)
            .await?
            .ok_or_else(|| Error::NotFound(format!("configuration snapshot of runner {runner}")))?;
        if snapshot.deployment_template.pipeline_id != pipeline.id {
            return Err(Error::InvalidInput(format!(
                "runner {runner} did not deploy pipeline {}",
                pipeline.id
            )));
        }

        let mut chart = self.configs.chart(pipeline.app_id).await?;
        chart.chart_ref_id = snapshot.deployment_template.chart_ref_id;
        chart.chart_version = snapshot.deployment_template.chart_version.clone();
        chart.image_descriptor_template = snapshot.deployment_template.image_descriptor_template.clone();

        let mut names = referenced_variables(&snapshot.deployment_template.template);
        names.extend(referenced_variables(&bundle_json(&snapshot.config_maps_secrets)?));
        let missing: BTreeSet<String> = names
            .into_iter()
            .filter(|n| !snapshot.variables.contains_key(n))
            .collect();
        if !missing.is_empty() {
            debug!(runner_id = %runner, missing = ?missing, "Resolving variables absent from snapshot");
            let resolved = self.resolve_variables(pipeline, missing).await?;
            snapshot.variables.extend(resolved);
        }

        snapshot.deployment_template.deployed_on = Utc::now();
        snapshot.deployment_template.deployed_by = triggered_by;
        info!(pipeline_id = %pipeline.id, from_runner = %runner, "Replaying recorded configuration");
        Ok(ResolvedConfig {
            chart,
            env_config_override_id: snapshot.deployment_template.env_config_override_id,
            snapshot,
        })
    }

    async fn resolve_variables(
        &self,
        pipeline: &Pipeline,
        names: BTreeSet<String>,
    ) -> Result<BTreeMap<String, String>> {
        if names.is_empty() {
            return Ok(BTreeMap::new());
        }
        let names: Vec<String> = names.into_iter().collect();
        self.variables
            .resolve(&VariableScope::from(pipeline), &names)
            .await
    }
}

fn bundle_json<T: serde::Serialize>(bundle: &T) -> Result<serde_json::Value> {
    serde_json::to_value(bundle)
        .map_err(|e| Error::Internal(format!("encode config maps and secrets: {e}")))
}
