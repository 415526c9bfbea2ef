//! Shipping backends for deckhand.
//!
//! - [`HttpHelmClient`]: install/upgrade and release status via the Helm executor
//! - [`GitHubGitOpsClient`]: commits rendered values into the GitOps repository
//! - [`ArgoCdRestClient`]: reads, patches and syncs ArgoCD applications
//! - [`KubeClusterReader`]: reads live objects (HPA, keda) from target clusters

pub mod argocd;
pub mod error;
pub mod gitops;
pub mod helm;
pub mod kubernetes;

pub use argocd::ArgoCdRestClient;
pub use deckhand_core::deployer::{
    AppHealth, ArgoApplication, ArgoCdClient, ClusterReader, CommitInfo, GitOpsClient,
    HelmAppIdentifier, HelmClient, HelmReleaseRequest, HelmReleaseState, PatchType,
    ReleaseStatus, ResourceRef, ValuesCommit,
};
pub use error::ClientError;
pub use gitops::GitHubGitOpsClient;
pub use helm::HttpHelmClient;
pub use kubernetes::KubeClusterReader;
