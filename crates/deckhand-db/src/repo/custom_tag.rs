//! Custom tag counters and image path reservations.

use async_trait::async_trait;
use deckhand_core::ReservationId;
use deckhand_core::tag::{CustomTag, ReservedImages, TagPattern};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use crate::{DbError, DbResult};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CustomTagRecord {
    pub id: i64,
    pub entity_key: i64,
    pub entity_value: String,
    pub tag_pattern: String,
    pub auto_increasing_number: i64,
    pub enabled: bool,
}

impl From<CustomTagRecord> for CustomTag {
    fn from(r: CustomTagRecord) -> Self {
        CustomTag {
            id: r.id,
            entity_key: r.entity_key,
            entity_value: r.entity_value,
            tag_pattern: r.tag_pattern,
            auto_increasing_number: r.auto_increasing_number,
            enabled: r.enabled,
        }
    }
}

#[async_trait]
pub trait CustomTagRepo: Send + Sync {
    async fn get(&self, entity_key: i64, entity_value: &str) -> DbResult<Option<CustomTag>>;

    /// Render the next tag of the entity's pattern, reserve `<repository>:<tag>`
    /// for each of `repositories` and advance the counter, all in one
    /// transaction.
    ///
    /// A path that is already reserved yields [`DbError::Duplicate`] naming it;
    /// nothing is reserved and the counter is not consumed.
    async fn reserve_next_tag(
        &self,
        entity_key: i64,
        entity_value: &str,
        repositories: &[String],
    ) -> DbResult<ReservedImages>;

    /// Reserve fully tagged image paths, all or nothing.
    async fn reserve_paths(&self, paths: &[String]) -> DbResult<Vec<ReservationId>>;

    /// Release reservations so the paths can be used again.
    async fn deactivate(&self, ids: &[ReservationId]) -> DbResult<()>;
}

/// PostgreSQL implementation of CustomTagRepo.
pub struct PgCustomTagRepo {
    pool: PgPool,
}

impl PgCustomTagRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn insert_reservations(
    tx: &mut Transaction<'_, Postgres>,
    paths: &[String],
) -> DbResult<Vec<ReservationId>> {
    let mut ids = Vec::with_capacity(paths.len());
    for path in paths {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO image_path_reservations (image_path, active, created_on)
            VALUES ($1, TRUE, NOW())
            RETURNING id
            "#,
        )
        .bind(path)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| DbError::unique(e, || path.clone()))?;
        ids.push(ReservationId(id));
    }
    Ok(ids)
}

#[async_trait]
impl CustomTagRepo for PgCustomTagRepo {
    async fn get(&self, entity_key: i64, entity_value: &str) -> DbResult<Option<CustomTag>> {
        let record = sqlx::query_as::<_, CustomTagRecord>(
            "SELECT * FROM custom_tags WHERE entity_key = $1 AND entity_value = $2 AND active = TRUE",
        )
        .bind(entity_key)
        .bind(entity_value)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record.map(Into::into))
    }

    async fn reserve_next_tag(
        &self,
        entity_key: i64,
        entity_value: &str,
        repositories: &[String],
    ) -> DbResult<ReservedImages> {
        let mut tx = self.pool.begin().await?;
        let record = sqlx::query_as::<_, CustomTagRecord>(
            r#"
            SELECT * FROM custom_tags
            WHERE entity_key = $1 AND entity_value = $2 AND active = TRUE
            FOR UPDATE
            "#,
        )
        .bind(entity_key)
        .bind(entity_value)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            DbError::NotFound(format!("custom tag for entity {entity_key}/{entity_value}"))
        })?;

        let pattern = TagPattern::parse(&record.tag_pattern)
            .map_err(|e| DbError::Rejected(e.to_string()))?;
        let tag = pattern
            .render(record.auto_increasing_number)
            .map_err(|e| DbError::Rejected(e.to_string()))?;
        let paths: Vec<String> = repositories
            .iter()
            .map(|repo| format!("{}:{}", repo.trim_end_matches('/'), tag))
            .collect();

        let reservation_ids = insert_reservations(&mut tx, &paths).await?;
        sqlx::query(
            "UPDATE custom_tags SET auto_increasing_number = auto_increasing_number + 1 WHERE id = $1",
        )
        .bind(record.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(entity_key, entity_value, tag = %tag, "reserved custom tag");
        Ok(ReservedImages {
            tag,
            paths,
            reservation_ids,
        })
    }

    async fn reserve_paths(&self, paths: &[String]) -> DbResult<Vec<ReservationId>> {
        let mut tx = self.pool.begin().await?;
        let ids = insert_reservations(&mut tx, paths).await?;
        tx.commit().await?;
        Ok(ids)
    }

    async fn deactivate(&self, ids: &[ReservationId]) -> DbResult<()> {
        let ids: Vec<i64> = ids.iter().map(|id| id.get()).collect();
        sqlx::query("UPDATE image_path_reservations SET active = FALSE WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
