//! Destination images and path reservations for the copy-container-image
//! plugin.

use deckhand_core::artifact::CiArtifact;
use deckhand_core::executor::CopyImageSpec;
use deckhand_core::pipeline::{RefPlugin, StageType};
use deckhand_core::secret::{DockerRegistry, RegistryCatalog};
use deckhand_core::tag::{ENTITY_POST_CD, ENTITY_PRE_CD};
use deckhand_core::{Error, PipelineId, ReservationId, Result};
use deckhand_db::{ArtifactRepo, CustomTagRepo, DbError};
use std::sync::Arc;
use tracing::{info, warn};

use crate::deps::Collaborators;

/// Plugin input listing destinations, one `registry | repo, repo` per line.
pub const DESTINATION_INFO: &str = "DESTINATION_INFO";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub registry_id: String,
    pub repositories: Vec<String>,
}

pub fn parse_destination_info(raw: &str) -> Result<Vec<Destination>> {
    let mut destinations = Vec::new();
    for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Some((registry, repos)) = line.split_once('|') else {
            return Err(Error::InvalidInput(format!(
                "invalid {DESTINATION_INFO} line: {line}"
            )));
        };
        let repositories: Vec<String> = repos
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect();
        let registry_id = registry.trim();
        if registry_id.is_empty() || repositories.is_empty() {
            return Err(Error::InvalidInput(format!(
                "invalid {DESTINATION_INFO} line: {line}"
            )));
        }
        destinations.push(Destination {
            registry_id: registry_id.to_string(),
            repositories,
        });
    }
    Ok(destinations)
}

/// Reserved destinations ready to hand to the executor.
#[derive(Debug, Clone)]
pub struct CopyImagePlan {
    pub spec: CopyImageSpec,
    pub reservation_ids: Vec<ReservationId>,
}

fn entity_key(stage: StageType) -> i64 {
    match stage {
        StageType::Pre => ENTITY_PRE_CD,
        StageType::Post => ENTITY_POST_CD,
    }
}

fn path_in_use(err: DbError) -> Error {
    match err {
        DbError::Duplicate(path) => Error::ImagePathInUse(path),
        other => other.into(),
    }
}

pub struct ImageReservations {
    custom_tags: Arc<dyn CustomTagRepo>,
    registries: Arc<dyn RegistryCatalog>,
    artifacts: Arc<dyn ArtifactRepo>,
}

impl ImageReservations {
    pub fn from_collaborators(deps: &Collaborators) -> Self {
        Self {
            custom_tags: deps.custom_tags.clone(),
            registries: deps.registries.clone(),
            artifacts: deps.artifacts.clone(),
        }
    }

    /// Fail when an existing artifact already uses one of `paths`.
    async fn ensure_unpublished(&self, paths: &[String]) -> Result<()> {
        let existing = self.artifacts.find_by_image_paths(paths).await?;
        match existing.first() {
            Some(artifact) => Err(Error::ImagePathInUse(artifact.image.clone())),
            None => Ok(()),
        }
    }

    /// Compute and reserve every destination of a copy-image plugin.
    ///
    /// With an enabled custom tag for the stage the tag comes from its
    /// pattern and the counter is consumed only if every path reserves.
    /// Otherwise the source image's tag is reused. A path already reserved,
    /// or already the image of an existing artifact, fails with
    /// [`Error::ImagePathInUse`].
    pub async fn reserve(
        &self,
        pipeline_id: PipelineId,
        stage: StageType,
        plugin: &RefPlugin,
        artifact: &CiArtifact,
    ) -> Result<CopyImagePlan> {
        let raw = plugin.input(DESTINATION_INFO).ok_or_else(|| {
            Error::InvalidInput(format!("{} has no {DESTINATION_INFO}", plugin.name))
        })?;
        let destinations = parse_destination_info(raw)?;

        let mut registries: Vec<DockerRegistry> = Vec::with_capacity(destinations.len());
        let mut repositories = Vec::new();
        for destination in &destinations {
            let registry = self.registries.get(&destination.registry_id).await?;
            repositories.extend(
                destination
                    .repositories
                    .iter()
                    .map(|repo| registry.repository_path(repo)),
            );
            if !registries.iter().any(|r| r.id == registry.id) {
                registries.push(registry);
            }
        }

        let key = entity_key(stage);
        let value = pipeline_id.to_string();
        let custom_tag = self.custom_tags.get(key, &value).await?;
        let (paths, reservation_ids) = match custom_tag {
            Some(tag) if tag.enabled => {
                let reserved = self
                    .custom_tags
                    .reserve_next_tag(key, &value, &repositories)
                    .await
                    .map_err(path_in_use)?;
                if let Err(e) = self.ensure_unpublished(&reserved.paths).await {
                    self.release(&reserved.reservation_ids).await;
                    return Err(e);
                }
                (reserved.paths, reserved.reservation_ids)
            }
            _ => {
                let tag = artifact.image_tag();
                if tag.is_empty() {
                    return Err(Error::InvalidInput(format!(
                        "source image {} has no tag to copy",
                        artifact.image
                    )));
                }
                let paths: Vec<String> = repositories
                    .iter()
                    .map(|repo| format!("{repo}:{tag}"))
                    .collect();
                self.ensure_unpublished(&paths).await?;
                let ids = self
                    .custom_tags
                    .reserve_paths(&paths)
                    .await
                    .map_err(path_in_use)?;
                (paths, ids)
            }
        };

        info!(pipeline_id = %pipeline_id, destinations = ?paths, "Reserved copy-image destinations");
        Ok(CopyImagePlan {
            spec: CopyImageSpec {
                source_image: artifact.image.clone(),
                destinations: paths,
                registries,
            },
            reservation_ids,
        })
    }

    /// Release reservations held by a runner that will not publish them.
    pub async fn release(&self, ids: &[ReservationId]) {
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.custom_tags.deactivate(ids).await {
            warn!(reservations = ?ids, error = %e, "Failed to deactivate image path reservations");
        }
    }
}
