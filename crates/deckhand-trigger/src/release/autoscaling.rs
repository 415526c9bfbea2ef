//! Replica reconciliation against the live HorizontalPodAutoscaler.

use deckhand_config::AutoscalingKeys;
use deckhand_core::deployer::{ClusterReader, ResourceRef};
use deckhand_core::pipeline::Pipeline;
use deckhand_core::release::DeploymentType;
use deckhand_core::{Error, Result};
use serde_json::{Map, Value};
use serde_json_path::JsonPath;
use std::sync::Arc;
use tracing::{debug, info, warn};

const KEDA_PREFIX: &str = "keda-hpa-";

fn json_path(path: &str) -> Result<JsonPath> {
    let selector: String = path
        .split('.')
        .map(|segment| format!("['{}']", segment.replace('\\', "\\\\").replace('\'', "\\'")))
        .collect();
    JsonPath::parse(&format!("${selector}"))
        .map_err(|e| Error::InvalidInput(format!("invalid values path {path}: {e}")))
}

/// The value at a dot-separated path of a values document.
pub fn value_at<'a>(values: &'a Value, path: &str) -> Result<Option<&'a Value>> {
    let path = json_path(path)?;
    Ok(path.query(values).at_most_one().ok().flatten())
}

/// Set the value at a dot-separated path, creating intermediate objects.
pub fn set_value_at(values: &mut Value, path: &str, value: Value) {
    let mut current = values;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map.entry(segment.to_string()).or_insert(Value::Null);
    }
}

fn as_int(value: Option<&Value>) -> Option<i64> {
    value.and_then(|v| match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    })
}

pub fn clamp_replicas(current: i64, min: Option<i64>, max: Option<i64>) -> i64 {
    let low = min.unwrap_or(current);
    let high = max.unwrap_or(current).max(low);
    current.clamp(low, high)
}

pub struct AutoscalingReconciler {
    cluster: Arc<dyn ClusterReader>,
    keys: AutoscalingKeys,
}

impl AutoscalingReconciler {
    pub fn new(cluster: Arc<dyn ClusterReader>, keys: AutoscalingKeys) -> Self {
        Self { cluster, keys }
    }

    /// Adjust `values` before shipping.
    ///
    /// A stop request always scales to zero, including the replica bounds,
    /// with autoscaling off. Otherwise,
    /// when autoscaling is enabled, the replica count follows the deployed
    /// HPA's current replicas clamped into the configured bounds.
    pub async fn reconcile(
        &self,
        pipeline: &Pipeline,
        deployment_type: DeploymentType,
        values: &mut Value,
    ) -> Result<()> {
        if deployment_type == DeploymentType::Stop {
            set_value_at(values, &self.keys.replica_count_path, Value::from(0));
            set_value_at(values, &self.keys.enabled_path, Value::Bool(false));
            set_value_at(values, &self.keys.min_replicas_path, Value::from(0));
            set_value_at(values, &self.keys.max_replicas_path, Value::from(0));
            info!(pipeline_id = %pipeline.id, "Hibernating: replicas forced to 0");
            return Ok(());
        }

        let enabled = value_at(values, &self.keys.enabled_path)?
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !enabled {
            return Ok(());
        }

        let Some(current) = self.current_replicas(pipeline).await else {
            return Ok(());
        };
        let min = as_int(value_at(values, &self.keys.min_replicas_path)?);
        let max = as_int(value_at(values, &self.keys.max_replicas_path)?);
        let replicas = clamp_replicas(current, min, max);
        debug!(pipeline_id = %pipeline.id, current, replicas, "Reconciled replicas with HPA");
        set_value_at(values, &self.keys.replica_count_path, Value::from(replicas));
        Ok(())
    }

    async fn current_replicas(&self, pipeline: &Pipeline) -> Option<i64> {
        let release = pipeline.app_release_name();
        for name in [release.clone(), format!("{KEDA_PREFIX}{release}")] {
            let hpa = ResourceRef {
                group: "autoscaling".to_string(),
                version: "v2".to_string(),
                kind: "HorizontalPodAutoscaler".to_string(),
                namespace: pipeline.namespace.clone(),
                name,
            };
            match self.cluster.get_resource(pipeline.cluster_id, &hpa).await {
                Ok(Some(object)) => {
                    return object
                        .pointer("/status/currentReplicas")
                        .and_then(Value::as_i64);
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(pipeline_id = %pipeline.id, hpa = %hpa.name, error = %e, "Failed to read HPA");
                    return None;
                }
            }
        }
        None
    }
}
