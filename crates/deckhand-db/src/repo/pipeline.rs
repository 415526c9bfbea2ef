//! Pipeline repository.

use async_trait::async_trait;
use deckhand_core::PipelineId;
use deckhand_core::pipeline::{ApprovalConfig, Pipeline, PipelineStage, StageStep, StageType};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::decode;
use crate::{DbError, DbResult};

/// A CD pipeline record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PipelineRecord {
    pub id: i64,
    pub name: String,
    pub app_id: i64,
    pub app_name: String,
    pub env_id: i64,
    pub env_name: String,
    pub cluster_id: i64,
    pub project_id: i64,
    pub namespace: String,
    pub is_prod: bool,
    pub ci_pipeline_id: i64,
    pub parent_pipeline_id: Option<i64>,
    pub deployment_app_type: String,
    pub trigger_type: String,
    pub pre_trigger_type: String,
    pub post_trigger_type: String,
    pub pre_stage_yaml: Option<String>,
    pub post_stage_yaml: Option<String>,
    pub pre_runs_in_env: bool,
    pub post_runs_in_env: bool,
    pub deployment_app_created: bool,
    pub deployment_app_name: String,
    pub required_approvals: Option<i32>,
}

impl TryFrom<PipelineRecord> for Pipeline {
    type Error = DbError;

    fn try_from(r: PipelineRecord) -> DbResult<Self> {
        Ok(Pipeline {
            id: PipelineId(r.id),
            name: r.name,
            app_id: r.app_id,
            app_name: r.app_name,
            env_id: r.env_id,
            env_name: r.env_name,
            cluster_id: r.cluster_id,
            project_id: r.project_id,
            namespace: r.namespace,
            is_prod: r.is_prod,
            ci_pipeline_id: r.ci_pipeline_id,
            parent_pipeline_id: r.parent_pipeline_id.map(PipelineId),
            deployment_app_type: decode("deployment_app_type", &r.deployment_app_type)?,
            trigger_type: decode("trigger_type", &r.trigger_type)?,
            pre_trigger_type: decode("pre_trigger_type", &r.pre_trigger_type)?,
            post_trigger_type: decode("post_trigger_type", &r.post_trigger_type)?,
            pre_stage_yaml: r.pre_stage_yaml,
            post_stage_yaml: r.post_stage_yaml,
            pre_runs_in_env: r.pre_runs_in_env,
            post_runs_in_env: r.post_runs_in_env,
            deployment_app_created: r.deployment_app_created,
            deployment_app_name: r.deployment_app_name,
            approval: r
                .required_approvals
                .filter(|n| *n > 0)
                .map(|n| ApprovalConfig {
                    required_approvals: n as u32,
                }),
        })
    }
}

/// A structured pre/post stage record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StageRecord {
    pub id: i64,
    pub pipeline_id: i64,
    pub stage_type: String,
    pub steps: serde_json::Value,
}

impl TryFrom<StageRecord> for PipelineStage {
    type Error = DbError;

    fn try_from(r: StageRecord) -> DbResult<Self> {
        let stage_type = match r.stage_type.as_str() {
            "PRE" => StageType::Pre,
            "POST" => StageType::Post,
            other => return Err(DbError::Decode(format!("stage_type: {other}"))),
        };
        let steps: Vec<StageStep> = serde_json::from_value(r.steps)
            .map_err(|e| DbError::Decode(format!("stage {} steps: {e}", r.id)))?;
        Ok(PipelineStage {
            id: r.id,
            pipeline_id: PipelineId(r.pipeline_id),
            stage_type,
            steps,
        })
    }
}

#[async_trait]
pub trait PipelineRepo: Send + Sync {
    async fn get(&self, id: PipelineId) -> DbResult<Pipeline>;

    /// Pipelines fed directly by a CI pipeline (no parent CD pipeline).
    async fn find_by_ci_pipeline(&self, ci_pipeline_id: i64) -> DbResult<Vec<Pipeline>>;

    /// Pipelines mapped to an external-CI webhook.
    async fn find_by_external_ci(&self, external_ci_id: i64) -> DbResult<Vec<Pipeline>>;

    /// Pipelines whose parent is the given CD pipeline.
    async fn find_children(&self, parent: PipelineId) -> DbResult<Vec<Pipeline>>;

    async fn set_deployment_app_created(&self, id: PipelineId, created: bool) -> DbResult<()>;

    async fn get_stage(&self, id: PipelineId, stage: StageType) -> DbResult<Option<PipelineStage>>;

    /// Soft-delete a stage. Deleting an already deleted stage is a no-op.
    async fn delete_stage(&self, stage_id: i64) -> DbResult<()>;
}

/// PostgreSQL implementation of PipelineRepo.
pub struct PgPipelineRepo {
    pool: PgPool,
}

impl PgPipelineRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn list(&self, filter: &str, id: i64) -> DbResult<Vec<Pipeline>> {
        let sql = format!(
            "SELECT * FROM cd_pipelines WHERE {filter} = $1 AND deleted = FALSE ORDER BY id"
        );
        let records = sqlx::query_as::<_, PipelineRecord>(&sql)
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        records.into_iter().map(Pipeline::try_from).collect()
    }
}

#[async_trait]
impl PipelineRepo for PgPipelineRepo {
    async fn get(&self, id: PipelineId) -> DbResult<Pipeline> {
        let record = sqlx::query_as::<_, PipelineRecord>(
            "SELECT * FROM cd_pipelines WHERE id = $1 AND deleted = FALSE",
        )
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("pipeline {}", id)))?;
        record.try_into()
    }

    async fn find_by_ci_pipeline(&self, ci_pipeline_id: i64) -> DbResult<Vec<Pipeline>> {
        let records = sqlx::query_as::<_, PipelineRecord>(
            r#"
            SELECT * FROM cd_pipelines
            WHERE ci_pipeline_id = $1 AND parent_pipeline_id IS NULL AND deleted = FALSE
            ORDER BY id
            "#,
        )
        .bind(ci_pipeline_id)
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Pipeline::try_from).collect()
    }

    async fn find_by_external_ci(&self, external_ci_id: i64) -> DbResult<Vec<Pipeline>> {
        self.list("external_ci_id", external_ci_id).await
    }

    async fn find_children(&self, parent: PipelineId) -> DbResult<Vec<Pipeline>> {
        self.list("parent_pipeline_id", parent.get()).await
    }

    async fn set_deployment_app_created(&self, id: PipelineId, created: bool) -> DbResult<()> {
        sqlx::query("UPDATE cd_pipelines SET deployment_app_created = $2 WHERE id = $1")
            .bind(id.get())
            .bind(created)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_stage(&self, id: PipelineId, stage: StageType) -> DbResult<Option<PipelineStage>> {
        let record = sqlx::query_as::<_, StageRecord>(
            r#"
            SELECT id, pipeline_id, stage_type, steps FROM pipeline_stages
            WHERE pipeline_id = $1 AND stage_type = $2 AND deleted = FALSE
            "#,
        )
        .bind(id.get())
        .bind(stage.as_str())
        .fetch_optional(&self.pool)
        .await?;
        record.map(PipelineStage::try_from).transpose()
    }

    async fn delete_stage(&self, stage_id: i64) -> DbResult<()> {
        sqlx::query("UPDATE pipeline_stages SET deleted = TRUE WHERE id = $1")
            .bind(stage_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deckhand_core::pipeline::{DeploymentAppType, TriggerType};

    fn record() -> PipelineRecord {
        PipelineRecord {
            id: 10,
            name: "cd-10".to_string(),
            app_id: 1,
            app_name: "payments".to_string(),
            env_id: 5,
            env_name: "prod".to_string(),
            cluster_id: 2,
            project_id: 3,
            namespace: "payments-prod".to_string(),
            is_prod: true,
            ci_pipeline_id: 7,
            parent_pipeline_id: None,
            deployment_app_type: "helm".to_string(),
            trigger_type: "AUTOMATIC".to_string(),
            pre_trigger_type: "MANUAL".to_string(),
            post_trigger_type: "AUTOMATIC".to_string(),
            pre_stage_yaml: None,
            post_stage_yaml: None,
            pre_runs_in_env: false,
            post_runs_in_env: false,
            deployment_app_created: false,
            deployment_app_name: String::new(),
            required_approvals: Some(0),
        }
    }

    #[test]
    fn test_record_into_pipeline() {
        let pipeline = Pipeline::try_from(record()).unwrap();
        assert_eq!(pipeline.id, PipelineId(10));
        assert_eq!(pipeline.deployment_app_type, DeploymentAppType::Helm);
        assert_eq!(pipeline.trigger_type, TriggerType::Automatic);
        assert!(pipeline.approval.is_none());
    }

    #[test]
    fn test_bad_enum_is_decode_error() {
        let mut r = record();
        r.trigger_type = "SOMETIMES".to_string();
        assert!(matches!(Pipeline::try_from(r), Err(DbError::Decode(_))));
    }

    #[test]
    fn test_stage_record_steps() {
        let r = StageRecord {
            id: 1,
            pipeline_id: 10,
            stage_type: "PRE".to_string(),
            steps: serde_json::json!([]),
        };
        let stage = PipelineStage::try_from(r).unwrap();
        assert!(stage.is_corrupted());
    }
}
