//! Audit history: release configuration snapshots, stage script history and
//! resource-filter audits.

use async_trait::async_trait;
use deckhand_core::history::{ConfigSnapshot, FilterAudit, StageScriptHistory};
use deckhand_core::RunnerId;
use sqlx::PgPool;

use crate::{DbError, DbResult};

#[async_trait]
pub trait HistoryRepo: Send + Sync {
    /// Attach the configuration a runner used. Written once per runner.
    async fn save_snapshot(&self, runner_id: RunnerId, snapshot: &ConfigSnapshot) -> DbResult<()>;
    async fn snapshot(&self, runner_id: RunnerId) -> DbResult<Option<ConfigSnapshot>>;
    async fn save_stage_history(&self, history: &StageScriptHistory) -> DbResult<()>;
    async fn save_filter_audit(&self, audit: &FilterAudit) -> DbResult<()>;
}

/// PostgreSQL implementation of HistoryRepo.
pub struct PgHistoryRepo {
    pool: PgPool,
}

impl PgHistoryRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryRepo for PgHistoryRepo {
    async fn save_snapshot(&self, runner_id: RunnerId, snapshot: &ConfigSnapshot) -> DbResult<()> {
        let doc = serde_json::to_value(snapshot)
            .map_err(|e| DbError::Decode(format!("snapshot for runner {runner_id}: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO config_snapshots (cd_workflow_runner_id, pipeline_id, snapshot, created_on)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (cd_workflow_runner_id) DO NOTHING
            "#,
        )
        .bind(runner_id.get())
        .bind(snapshot.deployment_template.pipeline_id.get())
        .bind(doc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn snapshot(&self, runner_id: RunnerId) -> DbResult<Option<ConfigSnapshot>> {
        let doc: Option<serde_json::Value> = sqlx::query_scalar(
            "SELECT snapshot FROM config_snapshots WHERE cd_workflow_runner_id = $1",
        )
        .bind(runner_id.get())
        .fetch_optional(&self.pool)
        .await?;
        doc.map(|d| {
            serde_json::from_value(d)
                .map_err(|e| DbError::Decode(format!("snapshot for runner {runner_id}: {e}")))
        })
        .transpose()
    }

    async fn save_stage_history(&self, history: &StageScriptHistory) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stage_script_histories (cd_workflow_runner_id, pipeline_id, stage_yaml,
                steps, triggered_on, triggered_by)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(history.runner_id.get())
        .bind(history.pipeline_id.get())
        .bind(&history.stage_yaml)
        .bind(&history.steps)
        .bind(history.triggered_on)
        .bind(history.triggered_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_filter_audit(&self, audit: &FilterAudit) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO resource_filter_audits (cd_workflow_runner_id, filter_ids, allowed, evaluated_on)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(audit.runner_id.get())
        .bind(&audit.filter_ids)
        .bind(audit.allowed)
        .bind(audit.evaluated_on)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
