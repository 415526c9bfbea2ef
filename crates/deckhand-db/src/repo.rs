//! Repository traits and implementations.

pub mod artifact;
pub mod config;
pub mod custom_tag;
pub mod history;
pub mod pipeline;
pub mod release;
pub mod timeline;
pub mod workflow;

pub use artifact::{ArtifactRepo, PgArtifactRepo};
pub use config::{ConfigRepo, PgConfigRepo};
pub use custom_tag::{CustomTagRepo, PgCustomTagRepo};
pub use history::{HistoryRepo, PgHistoryRepo};
pub use pipeline::{PgPipelineRepo, PipelineRepo};
pub use release::{OverrideRepo, PgOverrideRepo};
pub use timeline::{PgStatusRepo, StatusRepo, StatusUpdate};
pub use workflow::{PgWorkflowRepo, WorkflowRepo};
