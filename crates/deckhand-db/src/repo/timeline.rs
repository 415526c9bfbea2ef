//! Runner status and pipeline status timeline repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deckhand_core::RunnerId;
use deckhand_core::timeline::TimelineEntry;
use deckhand_core::workflow::CdWorkflowRunner;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};

use crate::DbResult;
use crate::error::decode;

const TERMINAL_RUNNER: &str = "('Succeeded', 'Failed', 'Aborted', 'Cancelled')";
const TERMINAL_TIMELINE: &str = "('HEALTHY', 'FAILED', 'DEPLOYMENT_SUPERSEDED', 'ABORTED', 'CANCELLED', 'TIMED_OUT', 'UNABLE_TO_FETCH_STATUS')";

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TimelineRecord {
    pub id: i64,
    pub cd_workflow_runner_id: i64,
    pub status: String,
    pub status_detail: String,
    pub status_time: DateTime<Utc>,
}

/// A runner status write with the timeline entry that goes with it.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub runner: CdWorkflowRunner,
    pub timeline: Option<TimelineEntry>,
}

#[async_trait]
pub trait StatusRepo: Send + Sync {
    /// Persist status, message, pod status and finish time of each runner
    /// together with its timeline entry, all in one transaction.
    ///
    /// Rows whose stored status is already terminal are left untouched, as is
    /// their timeline. Returns, per update, whether it was applied.
    async fn save_statuses(&self, updates: &[StatusUpdate]) -> DbResult<Vec<bool>>;

    /// Append a timeline entry unless the runner already has a terminal one.
    /// Returns whether the entry was written.
    async fn append_timeline(&self, entry: &TimelineEntry) -> DbResult<bool>;

    /// Timeline of a runner, oldest first.
    async fn timelines(&self, runner_id: RunnerId) -> DbResult<Vec<TimelineEntry>>;
}

/// PostgreSQL implementation of StatusRepo.
pub struct PgStatusRepo {
    pool: PgPool,
}

impl PgStatusRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn insert_timeline(tx: &mut Transaction<'_, Postgres>, entry: &TimelineEntry) -> DbResult<bool> {
    let sql = format!(
        r#"
        INSERT INTO pipeline_status_timelines (cd_workflow_runner_id, status, status_detail, status_time)
        SELECT $1, $2, $3, $4
        WHERE NOT EXISTS (
            SELECT 1 FROM pipeline_status_timelines
            WHERE cd_workflow_runner_id = $1 AND status IN {TERMINAL_TIMELINE}
        )
        "#
    );
    let result = sqlx::query(&sql)
        .bind(entry.runner_id.get())
        .bind(entry.status.as_str())
        .bind(&entry.status_detail)
        .bind(entry.status_time)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected() == 1)
}

#[async_trait]
impl StatusRepo for PgStatusRepo {
    async fn save_statuses(&self, updates: &[StatusUpdate]) -> DbResult<Vec<bool>> {
        let sql = format!(
            r#"
            UPDATE cd_workflow_runners
            SET status = $2, message = $3, pod_status = $4, pod_name = $5, finished_on = $6
            WHERE id = $1 AND status NOT IN {TERMINAL_RUNNER}
            "#
        );
        let mut tx = self.pool.begin().await?;
        let mut applied = Vec::with_capacity(updates.len());
        for update in updates {
            let r = &update.runner;
            let result = sqlx::query(&sql)
                .bind(r.id.get())
                .bind(r.status.as_str())
                .bind(&r.message)
                .bind(&r.pod_status)
                .bind(&r.pod_name)
                .bind(r.finished_on)
                .execute(&mut *tx)
                .await?;
            let written = result.rows_affected() == 1;
            if let (true, Some(entry)) = (written, &update.timeline) {
                insert_timeline(&mut tx, entry).await?;
            }
            applied.push(written);
        }
        tx.commit().await?;
        Ok(applied)
    }

    async fn append_timeline(&self, entry: &TimelineEntry) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;
        let written = insert_timeline(&mut tx, entry).await?;
        tx.commit().await?;
        Ok(written)
    }

    async fn timelines(&self, runner_id: RunnerId) -> DbResult<Vec<TimelineEntry>> {
        let records = sqlx::query_as::<_, TimelineRecord>(
            r#"
            SELECT * FROM pipeline_status_timelines
            WHERE cd_workflow_runner_id = $1
            ORDER BY status_time, id
            "#,
        )
        .bind(runner_id.get())
        .fetch_all(&self.pool)
        .await?;
        records
            .into_iter()
            .map(|r| {
                Ok(TimelineEntry {
                    runner_id: RunnerId(r.cd_workflow_runner_id),
                    status: decode("status", &r.status)?,
                    status_detail: r.status_detail,
                    status_time: r.status_time,
                })
            })
            .collect()
    }
}
