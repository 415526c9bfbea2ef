//! CD workflow and workflow-runner repository.
//!
//! Runner status columns are written only through
//! [`StatusRepo`](crate::repo::timeline::StatusRepo); this repository inserts
//! runners and updates their non-status details.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deckhand_core::workflow::{
    CdWorkflow, CdWorkflowRunner, NewRunner, RunnerStatus, WorkflowStatus, WorkflowType,
};
use deckhand_core::{ArtifactId, PipelineId, ReservationId, RunnerId, WorkflowId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::decode;
use crate::{DbError, DbResult};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkflowRecord {
    pub id: i64,
    pub pipeline_id: i64,
    pub ci_artifact_id: i64,
    pub workflow_status: Option<String>,
    pub created_on: DateTime<Utc>,
}

impl TryFrom<WorkflowRecord> for CdWorkflow {
    type Error = DbError;

    fn try_from(r: WorkflowRecord) -> DbResult<Self> {
        Ok(CdWorkflow {
            id: WorkflowId(r.id),
            pipeline_id: PipelineId(r.pipeline_id),
            ci_artifact_id: ArtifactId(r.ci_artifact_id),
            workflow_status: r
                .workflow_status
                .as_deref()
                .map(|s| decode("workflow_status", s))
                .transpose()?,
            created_on: r.created_on,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RunnerRecord {
    pub id: i64,
    pub cd_workflow_id: i64,
    pub pipeline_id: i64,
    pub workflow_type: String,
    pub executor_type: String,
    pub name: String,
    pub status: String,
    pub message: String,
    pub pod_status: Option<String>,
    pub pod_name: Option<String>,
    pub triggered_by: i64,
    pub started_on: DateTime<Utc>,
    pub finished_on: Option<DateTime<Utc>>,
    pub namespace: String,
    pub log_location: Option<String>,
    pub image_path_reservation_ids: Vec<i64>,
    pub ref_cd_workflow_runner_id: Option<i64>,
    pub reference_id: Option<String>,
}

impl TryFrom<RunnerRecord> for CdWorkflowRunner {
    type Error = DbError;

    fn try_from(r: RunnerRecord) -> DbResult<Self> {
        Ok(CdWorkflowRunner {
            id: RunnerId(r.id),
            workflow_id: WorkflowId(r.cd_workflow_id),
            pipeline_id: PipelineId(r.pipeline_id),
            workflow_type: decode("workflow_type", &r.workflow_type)?,
            executor_type: decode("executor_type", &r.executor_type)?,
            name: r.name,
            status: decode("status", &r.status)?,
            message: r.message,
            pod_status: r.pod_status,
            pod_name: r.pod_name,
            triggered_by: r.triggered_by,
            started_on: r.started_on,
            finished_on: r.finished_on,
            namespace: r.namespace,
            log_location: r.log_location,
            image_path_reservation_ids: r
                .image_path_reservation_ids
                .into_iter()
                .map(ReservationId)
                .collect(),
            ref_runner_id: r.ref_cd_workflow_runner_id.map(RunnerId),
            reference_id: r.reference_id,
        })
    }
}

#[async_trait]
pub trait WorkflowRepo: Send + Sync {
    async fn create_workflow(
        &self,
        pipeline_id: PipelineId,
        artifact_id: ArtifactId,
        status: Option<WorkflowStatus>,
    ) -> DbResult<CdWorkflow>;
    async fn get_workflow(&self, id: WorkflowId) -> DbResult<CdWorkflow>;
    async fn update_workflow_status(&self, id: WorkflowId, status: WorkflowStatus) -> DbResult<()>;

    /// Id of the newest workflow for the pipeline that has not been dropped.
    async fn latest_workflow_id(&self, pipeline_id: PipelineId) -> DbResult<Option<WorkflowId>>;

    /// Insert a runner. Fails with [`DbError::Duplicate`] when the workflow
    /// already has a runner of this type or the reference id was seen before.
    async fn create_runner(&self, runner: NewRunner) -> DbResult<CdWorkflowRunner>;
    async fn get_runner(&self, id: RunnerId) -> DbResult<CdWorkflowRunner>;
    async fn find_runner(
        &self,
        workflow_id: WorkflowId,
        workflow_type: WorkflowType,
    ) -> DbResult<Option<CdWorkflowRunner>>;
    async fn find_runner_by_reference(&self, reference_id: &str)
    -> DbResult<Option<CdWorkflowRunner>>;
    async fn find_runner_by_name(&self, name: &str) -> DbResult<Option<CdWorkflowRunner>>;

    /// Deploy runner with the largest id for the pipeline.
    async fn latest_deploy_runner(&self, pipeline_id: PipelineId)
    -> DbResult<Option<CdWorkflowRunner>>;

    /// Non-terminal deploy runners of the pipeline older than `before`.
    async fn non_terminal_deploy_runners(
        &self,
        pipeline_id: PipelineId,
        before: RunnerId,
    ) -> DbResult<Vec<CdWorkflowRunner>>;

    /// Deploy runners of any pipeline currently in one of `statuses`.
    async fn deploy_runners_in(&self, statuses: &[RunnerStatus]) -> DbResult<Vec<CdWorkflowRunner>>;

    /// Update namespace, log location, pod name and reservation ids.
    async fn update_runner_details(&self, runner: &CdWorkflowRunner) -> DbResult<()>;
}

/// PostgreSQL implementation of WorkflowRepo.
pub struct PgWorkflowRepo {
    pool: PgPool,
}

impl PgWorkflowRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowRepo for PgWorkflowRepo {
    async fn create_workflow(
        &self,
        pipeline_id: PipelineId,
        artifact_id: ArtifactId,
        status: Option<WorkflowStatus>,
    ) -> DbResult<CdWorkflow> {
        let record = sqlx::query_as::<_, WorkflowRecord>(
            r#"
            INSERT INTO cd_workflows (pipeline_id, ci_artifact_id, workflow_status, created_on)
            VALUES ($1, $2, $3, NOW())
            RETURNING *
            "#,
        )
        .bind(pipeline_id.get())
        .bind(artifact_id.get())
        .bind(status.map(|s| s.as_str()))
        .fetch_one(&self.pool)
        .await?;
        record.try_into()
    }

    async fn get_workflow(&self, id: WorkflowId) -> DbResult<CdWorkflow> {
        let record = sqlx::query_as::<_, WorkflowRecord>("SELECT * FROM cd_workflows WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("cd workflow {}", id)))?;
        record.try_into()
    }

    async fn update_workflow_status(&self, id: WorkflowId, status: WorkflowStatus) -> DbResult<()> {
        sqlx::query("UPDATE cd_workflows SET workflow_status = $2 WHERE id = $1")
            .bind(id.get())
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest_workflow_id(&self, pipeline_id: PipelineId) -> DbResult<Option<WorkflowId>> {
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(id) FROM cd_workflows
            WHERE pipeline_id = $1
              AND (workflow_status IS NULL OR workflow_status <> 'dropped_stale')
            "#,
        )
        .bind(pipeline_id.get())
        .fetch_one(&self.pool)
        .await?;
        Ok(id.map(WorkflowId))
    }

    async fn create_runner(&self, runner: NewRunner) -> DbResult<CdWorkflowRunner> {
        let record = sqlx::query_as::<_, RunnerRecord>(
            r#"
            INSERT INTO cd_workflow_runners (cd_workflow_id, pipeline_id, workflow_type,
                executor_type, name, status, message, triggered_by, started_on, namespace,
                log_location, image_path_reservation_ids, ref_cd_workflow_runner_id, reference_id)
            VALUES ($1, $2, $3, $4, $5, $6, '', $7, $8, $9, $10, '{}', $11, $12)
            RETURNING *
            "#,
        )
        .bind(runner.workflow_id.get())
        .bind(runner.pipeline_id.get())
        .bind(runner.workflow_type.as_str())
        .bind(runner.executor_type.as_str())
        .bind(&runner.name)
        .bind(runner.status.as_str())
        .bind(runner.triggered_by)
        .bind(runner.started_on)
        .bind(&runner.namespace)
        .bind(&runner.log_location)
        .bind(runner.ref_runner_id.map(|id| id.get()))
        .bind(&runner.reference_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            DbError::unique(e, || {
                format!(
                    "{} runner for workflow {}",
                    runner.workflow_type, runner.workflow_id
                )
            })
        })?;
        record.try_into()
    }

    async fn get_runner(&self, id: RunnerId) -> DbResult<CdWorkflowRunner> {
        let record =
            sqlx::query_as::<_, RunnerRecord>("SELECT * FROM cd_workflow_runners WHERE id = $1")
                .bind(id.get())
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("workflow runner {}", id)))?;
        record.try_into()
    }

    async fn find_runner(
        &self,
        workflow_id: WorkflowId,
        workflow_type: WorkflowType,
    ) -> DbResult<Option<CdWorkflowRunner>> {
        let record = sqlx::query_as::<_, RunnerRecord>(
            "SELECT * FROM cd_workflow_runners WHERE cd_workflow_id = $1 AND workflow_type = $2",
        )
        .bind(workflow_id.get())
        .bind(workflow_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        record.map(CdWorkflowRunner::try_from).transpose()
    }

    async fn find_runner_by_reference(
        &self,
        reference_id: &str,
    ) -> DbResult<Option<CdWorkflowRunner>> {
        let record = sqlx::query_as::<_, RunnerRecord>(
            "SELECT * FROM cd_workflow_runners WHERE reference_id = $1",
        )
        .bind(reference_id)
        .fetch_optional(&self.pool)
        .await?;
        record.map(CdWorkflowRunner::try_from).transpose()
    }

    async fn find_runner_by_name(&self, name: &str) -> DbResult<Option<CdWorkflowRunner>> {
        let record = sqlx::query_as::<_, RunnerRecord>(
            "SELECT * FROM cd_workflow_runners WHERE name = $1 ORDER BY id DESC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        record.map(CdWorkflowRunner::try_from).transpose()
    }

    async fn latest_deploy_runner(
        &self,
        pipeline_id: PipelineId,
    ) -> DbResult<Option<CdWorkflowRunner>> {
        let record = sqlx::query_as::<_, RunnerRecord>(
            r#"
            SELECT * FROM cd_workflow_runners
            WHERE pipeline_id = $1 AND workflow_type = 'DEPLOY'
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(pipeline_id.get())
        .fetch_optional(&self.pool)
        .await?;
        record.map(CdWorkflowRunner::try_from).transpose()
    }

    async fn non_terminal_deploy_runners(
        &self,
        pipeline_id: PipelineId,
        before: RunnerId,
    ) -> DbResult<Vec<CdWorkflowRunner>> {
        let records = sqlx::query_as::<_, RunnerRecord>(
            r#"
            SELECT * FROM cd_workflow_runners
            WHERE pipeline_id = $1 AND workflow_type = 'DEPLOY' AND id < $2
              AND status NOT IN ('Succeeded', 'Failed', 'Aborted', 'Cancelled')
            ORDER BY id
            "#,
        )
        .bind(pipeline_id.get())
        .bind(before.get())
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(CdWorkflowRunner::try_from).collect()
    }

    async fn deploy_runners_in(&self, statuses: &[RunnerStatus]) -> DbResult<Vec<CdWorkflowRunner>> {
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let records = sqlx::query_as::<_, RunnerRecord>(
            r#"
            SELECT * FROM cd_workflow_runners
            WHERE workflow_type = 'DEPLOY' AND status = ANY($1)
            ORDER BY id
            "#,
        )
        .bind(&statuses)
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(CdWorkflowRunner::try_from).collect()
    }

    async fn update_runner_details(&self, runner: &CdWorkflowRunner) -> DbResult<()> {
        let reservations: Vec<i64> = runner
            .image_path_reservation_ids
            .iter()
            .map(|id| id.get())
            .collect();
        sqlx::query(
            r#"
            UPDATE cd_workflow_runners
            SET namespace = $2, log_location = $3, pod_name = $4, image_path_reservation_ids = $5
            WHERE id = $1
            "#,
        )
        .bind(runner.id.get())
        .bind(&runner.namespace)
        .bind(&runner.log_location)
        .bind(&runner.pod_name)
        .bind(&reservations)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
