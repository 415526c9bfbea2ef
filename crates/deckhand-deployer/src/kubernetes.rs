//! Live object reads from target clusters.

use async_trait::async_trait;
use deckhand_core::deployer::{ClusterReader, ResourceRef};
use deckhand_core::{Error, Result};
use kube::Client;
use kube::api::{Api, DynamicObject};
use kube::core::{ApiResource, GroupVersionKind};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Reads objects with a client per cluster id.
///
/// Clusters without a registered client use the default one.
pub struct KubeClusterReader {
    default: Client,
    clusters: RwLock<HashMap<i64, Client>>,
}

impl KubeClusterReader {
    pub fn new(default: Client) -> Self {
        Self {
            default,
            clusters: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, cluster_id: i64, client: Client) {
        if let Ok(mut clusters) = self.clusters.write() {
            clusters.insert(cluster_id, client);
        }
    }

    fn client(&self, cluster_id: i64) -> Client {
        self.clusters
            .read()
            .ok()
            .and_then(|c| c.get(&cluster_id).cloned())
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl ClusterReader for KubeClusterReader {
    async fn get_resource(
        &self,
        cluster_id: i64,
        resource: &ResourceRef,
    ) -> Result<Option<serde_json::Value>> {
        let gvk = GroupVersionKind::gvk(&resource.group, &resource.version, &resource.kind);
        let api: Api<DynamicObject> = Api::namespaced_with(
            self.client(cluster_id),
            &resource.namespace,
            &ApiResource::from_gvk(&gvk),
        );
        let object = api.get_opt(&resource.name).await.map_err(|e| {
            Error::ExecutionFailed(format!(
                "read {} {}/{}: {e}",
                resource.kind, resource.namespace, resource.name
            ))
        })?;
        debug!(
            cluster_id,
            kind = %resource.kind,
            name = %resource.name,
            found = object.is_some(),
            "Read cluster resource"
        );
        object
            .map(|o| {
                serde_json::to_value(o)
                    .map_err(|e| Error::Internal(format!("encode {}: {e}", resource.kind)))
            })
            .transpose()
    }
}
