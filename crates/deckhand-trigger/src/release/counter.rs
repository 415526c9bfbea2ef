//! Pipeline release counter allocation.

use deckhand_core::release::{NewOverride, PipelineOverride};
use deckhand_core::{Error, Result};
use deckhand_db::{DbError, OverrideRepo};
use tracing::{debug, warn};

/// Create the override row of a workflow with the next release counter.
///
/// A workflow that already has an override keeps it, so redelivered releases
/// reuse their counter. A lost race on the `(pipeline, counter)` unique index
/// re-reads the maximum and tries again, up to `retries` times.
pub async fn allocate_release(
    overrides: &dyn OverrideRepo,
    new: NewOverride,
    retries: u32,
) -> Result<PipelineOverride> {
    if let Some(existing) = overrides.find_by_workflow(new.cd_workflow_id).await? {
        debug!(
            workflow_id = %new.cd_workflow_id,
            counter = existing.pipeline_release_counter,
            "Reusing release override"
        );
        return Ok(existing);
    }

    for attempt in 0..=retries {
        let counter = overrides.max_release_counter(new.pipeline_id).await? + 1;
        let candidate = NewOverride {
            pipeline_release_counter: counter,
            ..new.clone()
        };
        match overrides.create(&candidate).await {
            Ok(created) => return Ok(created),
            Err(DbError::Duplicate(what)) => {
                if let Some(existing) = overrides.find_by_workflow(new.cd_workflow_id).await? {
                    return Ok(existing);
                }
                warn!(
                    pipeline_id = %new.pipeline_id,
                    counter,
                    attempt,
                    conflict = %what,
                    "Release counter taken, retrying"
                );
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::Invariant(format!(
        "release counter for pipeline {} still conflicting after {} retries",
        new.pipeline_id, retries
    )))
}
