//! Kubernetes clients for stage workloads.

use deckhand_core::executor::WorkflowTarget;
use deckhand_core::{Error, Result};
use kube::Client;

/// Map a kube client error onto the core error kinds.
pub(crate) fn kube_error(context: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => {
            Error::NotFound(format!("{context}: {}", resp.message))
        }
        kube::Error::Api(resp) if resp.code == 409 => {
            Error::Conflict(format!("{context}: {}", resp.message))
        }
        kube::Error::Api(resp) => Error::ExecutionFailed(format!("{context}: {}", resp.message)),
        kube::Error::HyperError(e) => Error::Connection(format!("{context}: {e}")),
        kube::Error::Service(e) => Error::Connection(format!("{context}: {e}")),
        other => Error::ExecutionFailed(format!("{context}: {other}")),
    }
}

/// The in-cluster client plus on-demand clients for external clusters.
#[derive(Clone)]
pub struct ClusterClients {
    default: Client,
}

impl ClusterClients {
    /// Use the ambient kubeconfig or service account.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| Error::Connection(format!("kubernetes client: {e}")))?;
        Ok(Self { default: client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { default: client }
    }

    pub fn default_client(&self) -> Client {
        self.default.clone()
    }

    /// Client for the cluster a workflow runs in.
    pub fn client_for(&self, target: &WorkflowTarget) -> Result<Client> {
        let url = match (&target.cluster_url, target.is_ext) {
            (Some(url), true) => url,
            _ => return Ok(self.default.clone()),
        };
        let mut config = kube::Config::new(
            url.parse()
                .map_err(|e| Error::InvalidInput(format!("invalid cluster url {url}: {e}")))?,
        );
        config.default_namespace = target.namespace.clone();
        if let Some(token) = &target.token {
            config.auth_info.token = Some(token.clone().into());
        }
        Client::try_from(config).map_err(|e| kube_error("external cluster client", e))
    }
}
