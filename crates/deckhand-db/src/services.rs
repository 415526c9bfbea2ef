//! Postgres-backed lookups for the supporting services the trigger core
//! consults: scan results and CVE policy, approvals, promotions, resource
//! filters, registries, scoped variables and the notification outbox.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deckhand_core::artifact::ApprovalState;
use deckhand_core::secret::{DockerRegistry, RegistryCatalog, SecretString};
use deckhand_core::services::{
    ApprovalService, CdTriggerEvent, FilterStore, NotificationEvent, NotificationSink,
    PromotionApprovalMetadata, PromotionService, ResourceFilter, ScanService,
    ScopedVariableResolver, VariableScope,
};
use deckhand_core::{ArtifactId, PipelineId, Result};
use sqlx::PgPool;
use std::collections::BTreeMap;

use crate::DbError;

fn db(err: sqlx::Error) -> deckhand_core::Error {
    DbError::from(err).into()
}

fn decode_err(what: &str, err: serde_json::Error) -> deckhand_core::Error {
    DbError::Decode(format!("{what}: {err}")).into()
}

/// Scan results and CVE policy.
pub struct PgScanService {
    pool: PgPool,
}

impl PgScanService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScanService for PgScanService {
    async fn scan_result(&self, image_digest: &str) -> Result<Option<Vec<String>>> {
        sqlx::query_scalar("SELECT cve_names FROM image_scan_results WHERE image_digest = $1")
            .bind(image_digest)
            .fetch_optional(&self.pool)
            .await
            .map_err(db)
    }

    async fn blocked_cves(&self, cluster_id: i64, env_id: i64, app_id: i64) -> Result<Vec<String>> {
        // The most specific policy for each CVE decides.
        sqlx::query_scalar(
            r#"
            SELECT cve_name FROM (
                SELECT DISTINCT ON (cve_name) cve_name, action
                FROM cve_policies
                WHERE (cluster_id IS NULL OR cluster_id = $1)
                  AND (env_id IS NULL OR env_id = $2)
                  AND (app_id IS NULL OR app_id = $3)
                  AND deleted = FALSE
                ORDER BY cve_name,
                         (app_id IS NOT NULL) DESC,
                         (env_id IS NOT NULL) DESC,
                         (cluster_id IS NOT NULL) DESC
            ) p
            WHERE action = 'block'
            "#,
        )
        .bind(cluster_id)
        .bind(env_id)
        .bind(app_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)
    }

    async fn mark_image_deployed(&self, app_id: i64, env_id: i64, image_digest: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO image_scan_deploy_info (app_id, env_id, image_digest, updated_on)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (app_id, env_id)
            DO UPDATE SET image_digest = EXCLUDED.image_digest, updated_on = NOW()
            "#,
        )
        .bind(app_id)
        .bind(env_id)
        .bind(image_digest)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn clear_image_deployed(&self, app_id: i64, env_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM image_scan_deploy_info WHERE app_id = $1 AND env_id = $2")
            .bind(app_id)
            .bind(env_id)
            .execute(&self.pool)
            .await
            .map_err(db)?;
        Ok(())
    }
}

/// Artifact approvals.
pub struct PgApprovalService {
    pool: PgPool,
}

impl PgApprovalService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApprovalService for PgApprovalService {
    async fn approval_state(
        &self,
        pipeline_id: PipelineId,
        artifact_id: ArtifactId,
    ) -> Result<ApprovalState> {
        let state: Option<String> = sqlx::query_scalar(
            r#"
            SELECT state FROM artifact_approvals
            WHERE pipeline_id = $1 AND ci_artifact_id = $2 AND active = TRUE
            ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(pipeline_id.get())
        .bind(artifact_id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        Ok(match state.as_deref() {
            Some("requested") => ApprovalState::Requested,
            Some("approved") => ApprovalState::Approved,
            Some("consumed") => ApprovalState::Consumed,
            _ => ApprovalState::None,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PromotionRecord {
    ci_artifact_id: i64,
    approval_required: bool,
    approved_by: Vec<i64>,
    promoted_from: Option<String>,
    promoted_on: Option<DateTime<Utc>>,
}

/// Promotion metadata.
pub struct PgPromotionService {
    pool: PgPool,
}

impl PgPromotionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PromotionService for PgPromotionService {
    async fn promotion_metadata(
        &self,
        pipeline_id: PipelineId,
        artifact_ids: &[ArtifactId],
    ) -> Result<BTreeMap<ArtifactId, PromotionApprovalMetadata>> {
        let ids: Vec<i64> = artifact_ids.iter().map(|id| id.get()).collect();
        let records = sqlx::query_as::<_, PromotionRecord>(
            r#"
            SELECT ci_artifact_id, approval_required, approved_by, promoted_from, promoted_on
            FROM artifact_promotions
            WHERE destination_pipeline_id = $1 AND ci_artifact_id = ANY($2) AND active = TRUE
            "#,
        )
        .bind(pipeline_id.get())
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(records
            .into_iter()
            .map(|r| {
                (
                    ArtifactId(r.ci_artifact_id),
                    PromotionApprovalMetadata {
                        approval_required: r.approval_required,
                        approved_by: r.approved_by,
                        promoted_from: r.promoted_from,
                        promoted_on: r.promoted_on,
                    },
                )
            })
            .collect())
    }
}

#[derive(sqlx::FromRow)]
struct FilterRecord {
    id: i64,
    name: String,
    scope: serde_json::Value,
    conditions: serde_json::Value,
}

/// Resource filters and release tags.
pub struct PgFilterStore {
    pool: PgPool,
}

impl PgFilterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FilterStore for PgFilterStore {
    async fn active_filters(&self) -> Result<Vec<ResourceFilter>> {
        let records = sqlx::query_as::<_, FilterRecord>(
            "SELECT id, name, scope, conditions FROM resource_filters WHERE deleted = FALSE ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        records
            .into_iter()
            .map(|r| {
                Ok(ResourceFilter {
                    id: r.id,
                    scope: serde_json::from_value(r.scope)
                        .map_err(|e| decode_err(&format!("filter {} scope", r.id), e))?,
                    conditions: serde_json::from_value(r.conditions)
                        .map_err(|e| decode_err(&format!("filter {} conditions", r.id), e))?,
                    name: r.name,
                })
            })
            .collect()
    }

    async fn release_tags(&self, artifact_id: ArtifactId) -> Result<Vec<String>> {
        sqlx::query_scalar(
            "SELECT tag_name FROM release_tags WHERE ci_artifact_id = $1 AND deleted = FALSE",
        )
        .bind(artifact_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(db)
    }
}

#[derive(sqlx::FromRow)]
struct RegistryRecord {
    id: String,
    registry_url: String,
    registry_type: String,
    username: String,
    password: String,
}

/// Docker registry catalog.
pub struct PgRegistryCatalog {
    pool: PgPool,
}

impl PgRegistryCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RegistryCatalog for PgRegistryCatalog {
    async fn get(&self, registry_id: &str) -> Result<DockerRegistry> {
        let r = sqlx::query_as::<_, RegistryRecord>(
            r#"
            SELECT id, registry_url, registry_type, username, password
            FROM docker_registries WHERE id = $1 AND active = TRUE
            "#,
        )
        .bind(registry_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?
        .ok_or_else(|| deckhand_core::Error::NotFound(format!("docker registry {registry_id}")))?;
        Ok(DockerRegistry {
            id: r.id,
            registry_url: r.registry_url,
            registry_type: r.registry_type,
            username: r.username,
            password: SecretString::new(r.password),
        })
    }

    async fn image_pull_secret(&self, registry_id: &str, env_id: i64) -> Result<Option<String>> {
        // An env-specific secret wins over one that applies to every env.
        sqlx::query_scalar(
            r#"
            SELECT secret_name FROM registry_pull_secrets
            WHERE registry_id = $1 AND (env_id = $2 OR env_id IS NULL)
            ORDER BY env_id IS NULL
            LIMIT 1
            "#,
        )
        .bind(registry_id)
        .bind(env_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db)
    }
}

/// Scoped variables. The most specific definition of a name wins:
/// app+env, app, env, cluster, then global.
pub struct PgVariableResolver {
    pool: PgPool,
}

impl PgVariableResolver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScopedVariableResolver for PgVariableResolver {
    async fn resolve(
        &self,
        scope: &VariableScope,
        names: &[String],
    ) -> Result<BTreeMap<String, String>> {
        if names.is_empty() {
            return Ok(BTreeMap::new());
        }
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT DISTINCT ON (name) name, value
            FROM scoped_variables
            WHERE name = ANY($1) AND deleted = FALSE
              AND (app_id IS NULL OR app_id = $2)
              AND (env_id IS NULL OR env_id = $3)
              AND (cluster_id IS NULL OR cluster_id = $4)
            ORDER BY name,
                     (app_id IS NOT NULL AND env_id IS NOT NULL) DESC,
                     (app_id IS NOT NULL) DESC,
                     (env_id IS NOT NULL) DESC,
                     (cluster_id IS NOT NULL) DESC
            "#,
        )
        .bind(names)
        .bind(scope.app_id)
        .bind(scope.env_id)
        .bind(scope.cluster_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        Ok(rows.into_iter().collect())
    }
}

/// Writes notification and CD-trigger events to outbox tables read by the
/// notifier.
pub struct PgNotificationSink {
    pool: PgPool,
}

impl PgNotificationSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationSink for PgNotificationSink {
    async fn send(&self, event: NotificationEvent) -> Result<()> {
        let payload = serde_json::to_value(&event).map_err(|e| decode_err("notification", e))?;
        sqlx::query(
            r#"
            INSERT INTO notification_outbox (pipeline_id, cd_workflow_runner_id, kind, payload, created_on)
            VALUES ($1, $2, $3, $4, NOW())
            "#,
        )
        .bind(event.pipeline_id.get())
        .bind(event.runner_id.get())
        .bind(format!("{:?}", event.kind))
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn write_cd_trigger_event(&self, event: CdTriggerEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cd_trigger_events (pipeline_id, cd_workflow_runner_id, release_counter,
                pipeline_override_id, ci_artifact_id, commit_hashes, triggered_by, triggered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.pipeline_id.get())
        .bind(event.runner_id.get())
        .bind(event.release_counter)
        .bind(event.pipeline_override_id.get())
        .bind(event.ci_artifact_id.get())
        .bind(&event.commit_hashes)
        .bind(event.triggered_by)
        .bind(event.triggered_at)
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }
}
