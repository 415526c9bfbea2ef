//! Pipeline override (release record) repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deckhand_core::deployer::CommitInfo;
use deckhand_core::release::{NewOverride, OverrideStatus, PipelineOverride};
use deckhand_core::{ArtifactId, OverrideId, PipelineId, WorkflowId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::decode;
use crate::{DbError, DbResult};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OverrideRecord {
    pub id: i64,
    pub pipeline_id: i64,
    pub ci_artifact_id: i64,
    pub cd_workflow_id: i64,
    pub env_config_override_id: i64,
    pub pipeline_release_counter: i64,
    pub git_hash: Option<String>,
    pub commit_time: Option<DateTime<Utc>>,
    pub merged_values: serde_json::Value,
    pub release_override_values: serde_json::Value,
    pub deployment_type: String,
    pub status: String,
    pub created_by: i64,
    pub created_on: DateTime<Utc>,
}

impl TryFrom<OverrideRecord> for PipelineOverride {
    type Error = DbError;

    fn try_from(r: OverrideRecord) -> DbResult<Self> {
        let status = match r.status.as_str() {
            "new" => OverrideStatus::New,
            "success" => OverrideStatus::Success,
            other => return Err(DbError::Decode(format!("override status: {other}"))),
        };
        Ok(PipelineOverride {
            id: OverrideId(r.id),
            pipeline_id: PipelineId(r.pipeline_id),
            ci_artifact_id: ArtifactId(r.ci_artifact_id),
            cd_workflow_id: WorkflowId(r.cd_workflow_id),
            env_config_override_id: r.env_config_override_id,
            pipeline_release_counter: r.pipeline_release_counter,
            git_hash: r.git_hash,
            commit_time: r.commit_time,
            merged_values: r.merged_values,
            release_override_values: r.release_override_values,
            deployment_type: decode("deployment_type", &r.deployment_type)?,
            status,
            created_by: r.created_by,
            created_on: r.created_on,
        })
    }
}

#[async_trait]
pub trait OverrideRepo: Send + Sync {
    /// Highest release counter used by the pipeline, 0 when it never released.
    async fn max_release_counter(&self, pipeline_id: PipelineId) -> DbResult<i64>;

    /// Insert a release record. A taken `(pipeline, counter)` pair or a second
    /// record for the same workflow yields [`DbError::Duplicate`].
    async fn create(&self, new: &NewOverride) -> DbResult<PipelineOverride>;
    async fn get(&self, id: OverrideId) -> DbResult<PipelineOverride>;
    async fn find_by_workflow(&self, workflow_id: WorkflowId) -> DbResult<Option<PipelineOverride>>;

    /// Move a record to another counter; [`DbError::Duplicate`] when taken.
    async fn update_counter(&self, id: OverrideId, counter: i64) -> DbResult<()>;

    async fn save_values(
        &self,
        id: OverrideId,
        merged_values: &serde_json::Value,
        release_override_values: &serde_json::Value,
    ) -> DbResult<()>;
    async fn save_commit(&self, id: OverrideId, commit: &CommitInfo) -> DbResult<()>;
    async fn mark_success(&self, id: OverrideId) -> DbResult<()>;
}

/// PostgreSQL implementation of OverrideRepo.
pub struct PgOverrideRepo {
    pool: PgPool,
}

impl PgOverrideRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OverrideRepo for PgOverrideRepo {
    async fn max_release_counter(&self, pipeline_id: PipelineId) -> DbResult<i64> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(pipeline_release_counter) FROM pipeline_overrides WHERE pipeline_id = $1",
        )
        .bind(pipeline_id.get())
        .fetch_one(&self.pool)
        .await?;
        Ok(max.unwrap_or(0))
    }

    async fn create(&self, new: &NewOverride) -> DbResult<PipelineOverride> {
        let record = sqlx::query_as::<_, OverrideRecord>(
            r#"
            INSERT INTO pipeline_overrides (pipeline_id, ci_artifact_id, cd_workflow_id,
                env_config_override_id, pipeline_release_counter, merged_values,
                release_override_values, deployment_type, status, created_by, created_on)
            VALUES ($1, $2, $3, $4, $5, '{}', '{}', $6, 'new', $7, NOW())
            RETURNING *
            "#,
        )
        .bind(new.pipeline_id.get())
        .bind(new.ci_artifact_id.get())
        .bind(new.cd_workflow_id.get())
        .bind(new.env_config_override_id)
        .bind(new.pipeline_release_counter)
        .bind(new.deployment_type.as_str())
        .bind(new.created_by)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            DbError::unique(e, || {
                format!(
                    "release counter {} for pipeline {}",
                    new.pipeline_release_counter, new.pipeline_id
                )
            })
        })?;
        record.try_into()
    }

    async fn get(&self, id: OverrideId) -> DbResult<PipelineOverride> {
        let record =
            sqlx::query_as::<_, OverrideRecord>("SELECT * FROM pipeline_overrides WHERE id = $1")
                .bind(id.get())
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("pipeline override {}", id)))?;
        record.try_into()
    }

    async fn find_by_workflow(&self, workflow_id: WorkflowId) -> DbResult<Option<PipelineOverride>> {
        let record = sqlx::query_as::<_, OverrideRecord>(
            "SELECT * FROM pipeline_overrides WHERE cd_workflow_id = $1",
        )
        .bind(workflow_id.get())
        .fetch_optional(&self.pool)
        .await?;
        record.map(PipelineOverride::try_from).transpose()
    }

    async fn update_counter(&self, id: OverrideId, counter: i64) -> DbResult<()> {
        sqlx::query("UPDATE pipeline_overrides SET pipeline_release_counter = $2 WHERE id = $1")
            .bind(id.get())
            .bind(counter)
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::unique(e, || format!("release counter {counter}")))?;
        Ok(())
    }

    async fn save_values(
        &self,
        id: OverrideId,
        merged_values: &serde_json::Value,
        release_override_values: &serde_json::Value,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            UPDATE pipeline_overrides SET merged_values = $2, release_override_values = $3
            WHERE id = $1
            "#,
        )
        .bind(id.get())
        .bind(merged_values)
        .bind(release_override_values)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_commit(&self, id: OverrideId, commit: &CommitInfo) -> DbResult<()> {
        sqlx::query("UPDATE pipeline_overrides SET git_hash = $2, commit_time = $3 WHERE id = $1")
            .bind(id.get())
            .bind(&commit.hash)
            .bind(commit.time)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_success(&self, id: OverrideId) -> DbResult<()> {
        sqlx::query("UPDATE pipeline_overrides SET status = 'success' WHERE id = $1")
            .bind(id.get())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
