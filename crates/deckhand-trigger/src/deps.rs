//! Collaborator wiring.
//!
//! Every component of the trigger core reads its collaborators from one
//! [`Collaborators`] value. It can only be obtained from
//! [`CollaboratorsBuilder::build`], which refuses to produce a partially
//! wired set.

use deckhand_config::CdConfig;
use deckhand_core::deployer::{ArgoCdClient, ClusterReader, GitOpsClient, HelmClient};
use deckhand_core::events::EventBus;
use deckhand_core::executor::Executor;
use deckhand_core::secret::RegistryCatalog;
use deckhand_core::services::{
    ApprovalService, FilterStore, NotificationSink, PromotionService, ScanService,
    ScopedVariableResolver,
};
use deckhand_db::{
    ArtifactRepo, ConfigRepo, CustomTagRepo, HistoryRepo, OverrideRepo, PipelineRepo, StatusRepo,
    WorkflowRepo,
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("missing collaborator: {0}")]
    Missing(&'static str),
}

/// Repositories, cluster clients and supporting services used by the core.
#[derive(Clone)]
pub struct Collaborators {
    pub config: CdConfig,
    pub pipelines: Arc<dyn PipelineRepo>,
    pub artifacts: Arc<dyn ArtifactRepo>,
    pub workflows: Arc<dyn WorkflowRepo>,
    pub statuses: Arc<dyn StatusRepo>,
    pub overrides: Arc<dyn OverrideRepo>,
    pub configs: Arc<dyn ConfigRepo>,
    pub history: Arc<dyn HistoryRepo>,
    pub custom_tags: Arc<dyn CustomTagRepo>,
    pub executor: Arc<dyn Executor>,
    pub helm: Arc<dyn HelmClient>,
    pub gitops: Arc<dyn GitOpsClient>,
    pub argocd: Arc<dyn ArgoCdClient>,
    pub cluster: Arc<dyn ClusterReader>,
    pub bus: Arc<dyn EventBus>,
    pub scans: Arc<dyn ScanService>,
    pub approvals: Arc<dyn ApprovalService>,
    pub promotions: Arc<dyn PromotionService>,
    pub filters: Arc<dyn FilterStore>,
    pub registries: Arc<dyn RegistryCatalog>,
    pub notifier: Arc<dyn NotificationSink>,
    pub variables: Arc<dyn ScopedVariableResolver>,
}

impl Collaborators {
    pub fn builder(config: CdConfig) -> CollaboratorsBuilder {
        CollaboratorsBuilder {
            config,
            ..Default::default()
        }
    }
}

#[derive(Default)]
pub struct CollaboratorsBuilder {
    config: CdConfig,
    pipelines: Option<Arc<dyn PipelineRepo>>,
    artifacts: Option<Arc<dyn ArtifactRepo>>,
    workflows: Option<Arc<dyn WorkflowRepo>>,
    statuses: Option<Arc<dyn StatusRepo>>,
    overrides: Option<Arc<dyn OverrideRepo>>,
    configs: Option<Arc<dyn ConfigRepo>>,
    history: Option<Arc<dyn HistoryRepo>>,
    custom_tags: Option<Arc<dyn CustomTagRepo>>,
    executor: Option<Arc<dyn Executor>>,
    helm: Option<Arc<dyn HelmClient>>,
    gitops: Option<Arc<dyn GitOpsClient>>,
    argocd: Option<Arc<dyn ArgoCdClient>>,
    cluster: Option<Arc<dyn ClusterReader>>,
    bus: Option<Arc<dyn EventBus>>,
    scans: Option<Arc<dyn ScanService>>,
    approvals: Option<Arc<dyn ApprovalService>>,
    promotions: Option<Arc<dyn PromotionService>>,
    filters: Option<Arc<dyn FilterStore>>,
    registries: Option<Arc<dyn RegistryCatalog>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    variables: Option<Arc<dyn ScopedVariableResolver>>,
}

macro_rules! setters {
    ($($field:ident: $ty:ty),* $(,)?) => {
        $(
            pub fn $field(mut self, value: Arc<$ty>) -> Self {
                self.$field = Some(value);
                self
            }
        )*
    };
}

fn require<T: ?Sized>(value: Option<Arc<T>>, name: &'static str) -> Result<Arc<T>, BuildError> {
    value.ok_or(BuildError::Missing(name))
}

impl CollaboratorsBuilder {
    setters! {
        pipelines: dyn PipelineRepo,
        artifacts: dyn ArtifactRepo,
        workflows: dyn WorkflowRepo,
        statuses: dyn StatusRepo,
        overrides: dyn OverrideRepo,
        configs: dyn ConfigRepo,
        history: dyn HistoryRepo,
        custom_tags: dyn CustomTagRepo,
        executor: dyn Executor,
        helm: dyn HelmClient,
        gitops: dyn GitOpsClient,
        argocd: dyn ArgoCdClient,
        cluster: dyn ClusterReader,
        bus: dyn EventBus,
        scans: dyn ScanService,
        approvals: dyn ApprovalService,
        promotions: dyn PromotionService,
        filters: dyn FilterStore,
        registries: dyn RegistryCatalog,
        notifier: dyn NotificationSink,
        variables: dyn ScopedVariableResolver,
    }

    /// Fails with the name of the first collaborator that was never set.
    pub fn build(self) -> Result<Collaborators, BuildError> {
        Ok(Collaborators {
            config: self.config,
            pipelines: require(self.pipelines, "pipelines")?,
            artifacts: require(self.artifacts, "artifacts")?,
            workflows: require(self.workflows, "workflows")?,
            statuses: require(self.statuses, "statuses")?,
            overrides: require(self.overrides, "overrides")?,
            configs: require(self.configs, "configs")?,
            history: require(self.history, "history")?,
            custom_tags: require(self.custom_tags, "custom_tags")?,
            executor: require(self.executor, "executor")?,
            helm: require(self.helm, "helm")?,
            gitops: require(self.gitops, "gitops")?,
            argocd: require(self.argocd, "argocd")?,
            cluster: require(self.cluster, "cluster")?,
            bus: require(self.bus, "bus")?,
            scans: require(self.scans, "scans")?,
            approvals: require(self.approvals, "approvals")?,
            promotions: require(self.promotions, "promotions")?,
            filters: require(self.filters, "filters")?,
            registries: require(self.registries, "registries")?,
            notifier: require(self.notifier, "notifier")?,
            variables: require(self.variables, "variables")?,
        })
    }
}
