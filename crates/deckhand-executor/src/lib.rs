//! Stage executors for deckhand.
//!
//! Pre and post stages run either as Argo Workflows or as plain Kubernetes
//! Jobs (the `system` executor). Both build their manifests from a
//! [`WorkflowRequest`] with pure functions so the shape can be tested
//! without a cluster.

pub mod argo;
pub mod cluster;
pub mod system;

pub use argo::ArgoWorkflowExecutor;
pub use cluster::ClusterClients;
pub use deckhand_core::executor::{
    Executor, WorkflowHandle, WorkflowPhase, WorkflowRequest, WorkflowSnapshot, WorkflowTarget,
};
pub use system::JobExecutor;

use deckhand_config::ExecutorSettings;
use deckhand_core::workflow::ExecutorType;
use std::sync::Arc;

/// Label carrying the runner id on every stage resource.
pub const RUNNER_LABEL: &str = "deckhand.io/runner-id";
/// Label carrying the CD pipeline id.
pub const PIPELINE_LABEL: &str = "deckhand.io/pipeline-id";
/// Environment variable the stage runner image reads its request from.
pub const REQUEST_ENV: &str = "CD_REQUEST";

/// The executor configured for `kind`.
pub fn for_type(
    kind: ExecutorType,
    clients: ClusterClients,
    settings: ExecutorSettings,
    template_name: impl Into<String>,
) -> Arc<dyn Executor> {
    match kind {
        ExecutorType::ArgoWorkflow => {
            Arc::new(ArgoWorkflowExecutor::new(clients, settings, template_name))
        }
        ExecutorType::System => Arc::new(JobExecutor::new(clients, settings)),
    }
}
