//! Release configuration repository: charts, environment overrides,
//! strategies, configmaps and secrets, app labels and chart content.

use async_trait::async_trait;
use bytes::Bytes;
use deckhand_core::PipelineId;
use deckhand_core::release::{
    Chart, ConfigItem, ConfigMapSecretBundle, EnvConfigOverride, StrategyConfig,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::BTreeMap;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChartRecord {
    pub id: i64,
    pub app_id: i64,
    pub chart_ref_id: i64,
    pub chart_name: String,
    pub chart_version: String,
    pub image_descriptor_template: String,
    pub global_override: serde_json::Value,
    pub chart_location: String,
    pub git_repo_url: String,
    pub is_app_metrics_enabled: bool,
    pub is_custom_chart: bool,
}

impl From<ChartRecord> for Chart {
    fn from(r: ChartRecord) -> Self {
        Chart {
            id: r.id,
            app_id: r.app_id,
            chart_ref_id: r.chart_ref_id,
            chart_name: r.chart_name,
            chart_version: r.chart_version,
            image_descriptor_template: r.image_descriptor_template,
            global_override: r.global_override,
            chart_location: r.chart_location,
            git_repo_url: r.git_repo_url,
            is_app_metrics_enabled: r.is_app_metrics_enabled,
            is_custom_chart: r.is_custom_chart,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EnvOverrideRecord {
    pub id: i64,
    pub chart_id: i64,
    pub target_environment: i64,
    pub env_override_values: serde_json::Value,
    pub is_override: bool,
    pub is_app_metrics_enabled: Option<bool>,
    pub latest: bool,
}

impl From<EnvOverrideRecord> for EnvConfigOverride {
    fn from(r: EnvOverrideRecord) -> Self {
        EnvConfigOverride {
            id: r.id,
            chart_id: r.chart_id,
            target_environment: r.target_environment,
            env_override_values: r.env_override_values,
            is_override: r.is_override,
            is_app_metrics_enabled: r.is_app_metrics_enabled,
            latest: r.latest,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ConfigLevelRecord {
    config_maps: serde_json::Value,
    secrets: serde_json::Value,
}

fn items(column: &str, value: serde_json::Value) -> DbResult<Vec<ConfigItem>> {
    if value.is_null() {
        return Ok(Vec::new());
    }
    serde_json::from_value(value).map_err(|e| DbError::Decode(format!("{column}: {e}")))
}

#[async_trait]
pub trait ConfigRepo: Send + Sync {
    /// Latest chart of an app.
    async fn chart(&self, app_id: i64) -> DbResult<Chart>;

    /// The chart an env override belongs to.
    async fn chart_by_id(&self, chart_id: i64) -> DbResult<Chart>;

    /// Latest env override for the chart and environment, if any.
    async fn active_env_override(
        &self,
        chart_id: i64,
        env_id: i64,
    ) -> DbResult<Option<EnvConfigOverride>>;

    /// Create an empty env override that defers to the chart's values.
    async fn create_env_override(
        &self,
        chart: &Chart,
        env_id: i64,
        created_by: i64,
    ) -> DbResult<EnvConfigOverride>;

    async fn strategy(&self, pipeline_id: PipelineId) -> DbResult<Option<StrategyConfig>>;
    async fn config_maps_secrets(&self, app_id: i64, env_id: i64)
    -> DbResult<ConfigMapSecretBundle>;
    async fn app_labels(&self, app_id: i64) -> DbResult<BTreeMap<String, String>>;
    async fn db_migration_override(
        &self,
        pipeline_id: PipelineId,
    ) -> DbResult<Option<serde_json::Value>>;

    /// Packaged chart bytes for a chart reference.
    async fn chart_content(&self, chart_ref_id: i64) -> DbResult<Bytes>;
}

/// PostgreSQL implementation of ConfigRepo.
pub struct PgConfigRepo {
    pool: PgPool,
}

impl PgConfigRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConfigRepo for PgConfigRepo {
    async fn chart(&self, app_id: i64) -> DbResult<Chart> {
        let record = sqlx::query_as::<_, ChartRecord>(
            r#"
            SELECT id, app_id, chart_ref_id, chart_name, chart_version, image_descriptor_template,
                   global_override, chart_location, git_repo_url, is_app_metrics_enabled,
                   is_custom_chart
            FROM charts WHERE app_id = $1 AND latest = TRUE
            "#,
        )
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("chart for app {}", app_id)))?;
        Ok(record.into())
    }

    async fn chart_by_id(&self, chart_id: i64) -> DbResult<Chart> {
        let record = sqlx::query_as::<_, ChartRecord>(
            r#"
            SELECT id, app_id, chart_ref_id, chart_name, chart_version, image_descriptor_template,
                   global_override, chart_location, git_repo_url, is_app_metrics_enabled,
                   is_custom_chart
            FROM charts WHERE id = $1
            "#,
        )
        .bind(chart_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("chart {}", chart_id)))?;
        Ok(record.into())
    }

    async fn active_env_override(
        &self,
        chart_id: i64,
        env_id: i64,
    ) -> DbResult<Option<EnvConfigOverride>> {
        let record = sqlx::query_as::<_, EnvOverrideRecord>(
            r#"
            SELECT id, chart_id, target_environment, env_override_values, is_override,
                   is_app_metrics_enabled, latest
            FROM env_config_overrides
            WHERE chart_id = $1 AND target_environment = $2 AND latest = TRUE
            "#,
        )
        .bind(chart_id)
        .bind(env_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record.map(Into::into))
    }

    async fn create_env_override(
        &self,
        chart: &Chart,
        env_id: i64,
        created_by: i64,
    ) -> DbResult<EnvConfigOverride> {
        // A concurrent creator wins; return its row.
        let record = sqlx::query_as::<_, EnvOverrideRecord>(
            r#"
            INSERT INTO env_config_overrides (chart_id, target_environment, env_override_values,
                is_override, is_app_metrics_enabled, latest, created_by, created_on)
            VALUES ($1, $2, '{}', FALSE, NULL, TRUE, $3, NOW())
            ON CONFLICT (chart_id, target_environment) WHERE latest DO UPDATE SET latest = TRUE
            RETURNING id, chart_id, target_environment, env_override_values, is_override,
                      is_app_metrics_enabled, latest
            "#,
        )
        .bind(chart.id)
        .bind(env_id)
        .bind(created_by)
        .fetch_one(&self.pool)
        .await?;
        Ok(record.into())
    }

    async fn strategy(&self, pipeline_id: PipelineId) -> DbResult<Option<StrategyConfig>> {
        let row: Option<(String, serde_json::Value)> = sqlx::query_as(
            r#"
            SELECT strategy, config FROM pipeline_strategies
            WHERE pipeline_id = $1 AND is_default = TRUE AND deleted = FALSE
            "#,
        )
        .bind(pipeline_id.get())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(strategy, config)| StrategyConfig { strategy, config }))
    }

    async fn config_maps_secrets(
        &self,
        app_id: i64,
        env_id: i64,
    ) -> DbResult<ConfigMapSecretBundle> {
        let app = sqlx::query_as::<_, ConfigLevelRecord>(
            "SELECT config_maps, secrets FROM config_map_app_level WHERE app_id = $1",
        )
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await?;
        let env = sqlx::query_as::<_, ConfigLevelRecord>(
            "SELECT config_maps, secrets FROM config_map_env_level WHERE app_id = $1 AND env_id = $2",
        )
        .bind(app_id)
        .bind(env_id)
        .fetch_optional(&self.pool)
        .await?;

        let mut bundle = ConfigMapSecretBundle::default();
        if let Some(app) = app {
            bundle.app_config_maps = items("config_maps", app.config_maps)?;
            bundle.app_secrets = items("secrets", app.secrets)?;
        }
        if let Some(env) = env {
            bundle.env_config_maps = items("config_maps", env.config_maps)?;
            bundle.env_secrets = items("secrets", env.secrets)?;
        }
        Ok(bundle)
    }

    async fn app_labels(&self, app_id: i64) -> DbResult<BTreeMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM app_labels WHERE app_id = $1 AND propagate = TRUE")
                .bind(app_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    async fn db_migration_override(
        &self,
        pipeline_id: PipelineId,
    ) -> DbResult<Option<serde_json::Value>> {
        let values: Option<serde_json::Value> = sqlx::query_scalar(
            "SELECT values_override FROM db_migration_configs WHERE pipeline_id = $1 AND active = TRUE",
        )
        .bind(pipeline_id.get())
        .fetch_optional(&self.pool)
        .await?;
        Ok(values)
    }

    async fn chart_content(&self, chart_ref_id: i64) -> DbResult<Bytes> {
        let content: Vec<u8> = sqlx::query_scalar("SELECT content FROM chart_refs WHERE id = $1")
            .bind(chart_ref_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("chart ref {}", chart_ref_id)))?;
        Ok(Bytes::from(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_items_decode() {
        let value = json!([
            {"name": "app-cm", "type": "environment", "data": {"LOG_LEVEL": "info"}},
            {"name": "eso", "type": "volume", "external": true, "esoSecretData": {"key": "v"}}
        ]);
        let items = items("config_maps", value).unwrap();
        assert_eq!(items.len(), 2);
        assert!(items[1].external);
        assert!(items[1].eso_secret_data.is_some());
    }

    #[test]
    fn test_null_items_are_empty() {
        assert!(items("secrets", serde_json::Value::Null).unwrap().is_empty());
        assert!(matches!(
            items("secrets", json!({"not": "a list"})),
            Err(DbError::Decode(_))
        ));
    }
}
