//! CI artifact repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deckhand_core::artifact::{CiArtifact, NewArtifact};
use deckhand_core::{ArtifactId, PipelineId};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::decode;
use crate::{DbError, DbResult};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ArtifactRecord {
    pub id: i64,
    pub ci_pipeline_id: Option<i64>,
    pub component_id: Option<i64>,
    pub cd_pipeline_id: Option<i64>,
    pub external_ci_id: Option<i64>,
    pub image: String,
    pub image_digest: String,
    pub material_info: serde_json::Value,
    pub data_source: String,
    pub parent_ci_artifact: Option<i64>,
    pub credentials_source: Option<String>,
    pub scan_enabled: bool,
    pub scanned: bool,
    pub created_on: DateTime<Utc>,
}

impl TryFrom<ArtifactRecord> for CiArtifact {
    type Error = DbError;

    fn try_from(r: ArtifactRecord) -> DbResult<Self> {
        Ok(CiArtifact {
            id: ArtifactId(r.id),
            ci_pipeline_id: r.ci_pipeline_id,
            component_id: r.component_id,
            cd_pipeline_id: r.cd_pipeline_id.map(PipelineId),
            external_ci_id: r.external_ci_id,
            image: r.image,
            image_digest: r.image_digest,
            material_info: r.material_info,
            data_source: decode("data_source", &r.data_source)?,
            parent_ci_artifact: r.parent_ci_artifact.map(ArtifactId),
            credentials_source: r.credentials_source,
            scan_enabled: r.scan_enabled,
            scanned: r.scanned,
            created_on: r.created_on,
        })
    }
}

#[async_trait]
pub trait ArtifactRepo: Send + Sync {
    async fn get(&self, id: ArtifactId) -> DbResult<CiArtifact>;

    /// Artifacts already recorded for a CD pipeline with one of `images`.
    async fn find_by_images(
        &self,
        cd_pipeline_id: PipelineId,
        images: &[String],
    ) -> DbResult<Vec<CiArtifact>>;

    /// Artifacts of any pipeline whose image is one of `images`.
    async fn find_by_image_paths(&self, images: &[String]) -> DbResult<Vec<CiArtifact>>;

    /// Insert plugin-produced artifacts in one transaction.
    async fn create_many(&self, artifacts: &[NewArtifact]) -> DbResult<Vec<CiArtifact>>;
}

/// PostgreSQL implementation of ArtifactRepo.
pub struct PgArtifactRepo {
    pool: PgPool,
}

impl PgArtifactRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ArtifactRepo for PgArtifactRepo {
    async fn get(&self, id: ArtifactId) -> DbResult<CiArtifact> {
        let record = sqlx::query_as::<_, ArtifactRecord>("SELECT * FROM ci_artifacts WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("artifact {}", id)))?;
        record.try_into()
    }

    async fn find_by_images(
        &self,
        cd_pipeline_id: PipelineId,
        images: &[String],
    ) -> DbResult<Vec<CiArtifact>> {
        let records = sqlx::query_as::<_, ArtifactRecord>(
            "SELECT * FROM ci_artifacts WHERE cd_pipeline_id = $1 AND image = ANY($2)",
        )
        .bind(cd_pipeline_id.get())
        .bind(images)
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(CiArtifact::try_from).collect()
    }

    async fn find_by_image_paths(&self, images: &[String]) -> DbResult<Vec<CiArtifact>> {
        let records = sqlx::query_as::<_, ArtifactRecord>(
            "SELECT * FROM ci_artifacts WHERE image = ANY($1)",
        )
        .bind(images)
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(CiArtifact::try_from).collect()
    }

    async fn create_many(&self, artifacts: &[NewArtifact]) -> DbResult<Vec<CiArtifact>> {
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(artifacts.len());
        for a in artifacts {
            let record = sqlx::query_as::<_, ArtifactRecord>(
                r#"
                INSERT INTO ci_artifacts (image, image_digest, material_info, data_source,
                    cd_pipeline_id, parent_ci_artifact, credentials_source, scan_enabled,
                    scanned, created_on)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
                RETURNING *
                "#,
            )
            .bind(&a.image)
            .bind(&a.image_digest)
            .bind(&a.material_info)
            .bind(a.data_source.as_str())
            .bind(a.cd_pipeline_id.get())
            .bind(a.parent_ci_artifact.get())
            .bind(&a.credentials_source)
            .bind(a.scan_enabled)
            .bind(a.scanned)
            .fetch_one(&mut *tx)
            .await?;
            created.push(CiArtifact::try_from(record)?);
        }
        tx.commit().await?;
        Ok(created)
    }
}
