//! Layered values merge.
//!
//! The merged document is built by applying the layers of [`MergeLayer::ORDER`]
//! onto an empty object, each one as a JSON merge patch: objects merge
//! recursively, anything else replaces, `null` removes the key.

use deckhand_core::release::{Chart, ConfigItem, ConfigMapSecretBundle};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MergeLayer {
    Base,
    /// Env override if present, else the chart's global override.
    Template,
    Strategy,
    DbMigration,
    ReleaseOverride,
    ConfigMapSecret,
    AppLabels,
}

impl MergeLayer {
    pub const ORDER: [MergeLayer; 7] = [
        MergeLayer::Base,
        MergeLayer::Template,
        MergeLayer::Strategy,
        MergeLayer::DbMigration,
        MergeLayer::ReleaseOverride,
        MergeLayer::ConfigMapSecret,
        MergeLayer::AppLabels,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MergeLayer::Base => "base",
            MergeLayer::Template => "template",
            MergeLayer::Strategy => "strategy",
            MergeLayer::DbMigration => "db_migration",
            MergeLayer::ReleaseOverride => "release_override",
            MergeLayer::ConfigMapSecret => "config_map_secret",
            MergeLayer::AppLabels => "app_labels",
        }
    }
}

/// Documents for every layer but the base.
#[derive(Debug, Clone, Default)]
pub struct MergeInputs {
    pub template: Value,
    pub strategy: Option<Value>,
    pub db_migration: Option<Value>,
    pub release_override: Value,
    pub config_map_secret: Value,
    pub app_labels: Value,
}

impl MergeInputs {
    fn layer(&self, layer: MergeLayer) -> Option<&Value> {
        match layer {
            MergeLayer::Base => None,
            MergeLayer::Template => Some(&self.template),
            MergeLayer::Strategy => self.strategy.as_ref(),
            MergeLayer::DbMigration => self.db_migration.as_ref(),
            MergeLayer::ReleaseOverride => Some(&self.release_override),
            MergeLayer::ConfigMapSecret => Some(&self.config_map_secret),
            MergeLayer::AppLabels => Some(&self.app_labels),
        }
    }
}

pub fn merge_values(inputs: &MergeInputs) -> Value {
    let mut merged = Value::Object(Map::new());
    for layer in MergeLayer::ORDER {
        if let Some(doc) = inputs.layer(layer) {
            merge_patch(&mut merged, doc);
        }
    }
    merged
}

/// Apply `patch` onto `target` with JSON merge patch semantics.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Charts from this version on understand `esoSecretData`.
const EXTERNAL_SECRET_DATA_SINCE: (u32, u32) = (3, 8);

fn merge_items(app: &[ConfigItem], env: &[ConfigItem], deep: bool) -> Vec<ConfigItem> {
    let mut merged: Vec<ConfigItem> = app.to_vec();
    for item in env {
        match merged.iter_mut().find(|m| m.name == item.name) {
            Some(existing) if deep => {
                let mut data = existing.data.clone();
                merge_patch(&mut data, &item.data);
                *existing = ConfigItem {
                    data,
                    ..item.clone()
                };
            }
            Some(existing) => *existing = item.clone(),
            None => merged.push(item.clone()),
        }
    }
    merged
}

/// The configmap and secret layer: env items override app items by name.
///
/// Configmap data merges key by key, secrets are replaced whole. Charts older
/// than 3.8 get secrets without `esoSecretData`.
pub fn config_map_secret_json(bundle: &ConfigMapSecretBundle, chart: &Chart) -> Value {
    let maps = merge_items(&bundle.app_config_maps, &bundle.env_config_maps, true);
    let mut secrets = merge_items(&bundle.app_secrets, &bundle.env_secrets, false);
    if chart.version_parts() < EXTERNAL_SECRET_DATA_SINCE {
        for secret in &mut secrets {
            secret.eso_secret_data = None;
        }
    }
    json!({
        "ConfigMaps": {"enabled": !maps.is_empty(), "maps": maps},
        "ConfigSecrets": {"enabled": !secrets.is_empty(), "secrets": secrets},
    })
}

pub fn app_labels_json(labels: &BTreeMap<String, String>) -> Value {
    json!({ "appLabels": labels })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::chart;

    fn item(name: &str, data: Value) -> ConfigItem {
        ConfigItem {
            name: name.to_string(),
            mount_type: "environment".to_string(),
            external: false,
            data,
            eso_secret_data: None,
        }
    }

    #[test]
    fn test_later_layers_win() {
        let inputs = MergeInputs {
            template: json!({"replicaCount": 1, "image": {"pullPolicy": "IfNotPresent"}}),
            strategy: Some(json!({"deployment": {"strategy": {"rolling": {}}}})),
            db_migration: None,
            release_override: json!({"image": {"tag": "v1"}, "replicaCount": 3}),
            config_map_secret: json!({"ConfigMaps": {"enabled": false, "maps": []}}),
            app_labels: json!({"appLabels": {"team": "payments"}}),
        };
        let merged = merge_values(&inputs);
        assert_eq!(merged["replicaCount"], 3);
        assert_eq!(merged["image"]["pullPolicy"], "IfNotPresent");
        assert_eq!(merged["image"]["tag"], "v1");
        assert_eq!(merged["appLabels"]["team"], "payments");
        assert!(merged["deployment"]["strategy"]["rolling"].is_object());
    }

    #[test]
    fn test_layer_order_is_fixed() {
        assert_eq!(MergeLayer::ORDER.first(), Some(&MergeLayer::Base));
        assert_eq!(MergeLayer::ORDER.last(), Some(&MergeLayer::AppLabels));
        let mut sorted = MergeLayer::ORDER;
        sorted.sort();
        assert_eq!(sorted, MergeLayer::ORDER);
    }

    #[test]
    fn test_merge_patch_null_removes_key() {
        let mut target = json!({"a": 1, "b": {"c": 2, "d": 3}});
        merge_patch(&mut target, &json!({"b": {"c": null}, "e": [1]}));
        assert_eq!(target, json!({"a": 1, "b": {"d": 3}, "e": [1]}));
    }

    #[test]
    fn test_env_config_map_deep_merges_over_app() {
        let bundle = ConfigMapSecretBundle {
            app_config_maps: vec![item("app-cm", json!({"LOG_LEVEL": "info", "PORT": "80"}))],
            env_config_maps: vec![item("app-cm", json!({"LOG_LEVEL": "debug"}))],
            app_secrets: vec![item("db", json!({"PASSWORD": "a", "USER": "u"}))],
            env_secrets: vec![item("db", json!({"PASSWORD": "b"}))],
        };
        let doc = config_map_secret_json(&bundle, &chart());
        let maps = doc["ConfigMaps"]["maps"].as_array().unwrap();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0]["data"], json!({"LOG_LEVEL": "debug", "PORT": "80"}));
        let secrets = doc["ConfigSecrets"]["secrets"].as_array().unwrap();
        assert_eq!(secrets[0]["data"], json!({"PASSWORD": "b"}));
        assert_eq!(doc["ConfigSecrets"]["enabled"], true);
    }

    #[test]
    fn test_old_charts_drop_external_secret_data() {
        let mut secret = item("vault", json!({}));
        secret.eso_secret_data = Some(json!({"secretStore": "vault"}));
        let bundle = ConfigMapSecretBundle {
            app_secrets: vec![secret],
            ..Default::default()
        };
        let mut old = chart();
        old.chart_version = "3.7.0".to_string();
        let doc = config_map_secret_json(&bundle, &old);
        assert!(doc["ConfigSecrets"]["secrets"][0].get("esoSecretData").is_none());

        let doc = config_map_secret_json(&bundle, &chart());
        assert_eq!(
            doc["ConfigSecrets"]["secrets"][0]["esoSecretData"]["secretStore"],
            "vault"
        );
    }
}
