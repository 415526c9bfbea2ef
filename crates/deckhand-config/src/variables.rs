//! Template rendering for release values.
//!
//! Two placeholder syntaxes are handled:
//! - `{{.Name}}` style fields in a chart's image descriptor template, filled
//!   from [`ReleaseAttributes`]
//! - `@{{name}}` scoped variables inside deployment templates and configmaps,
//!   resolved against an app/env/cluster scope at trigger time

use deckhand_core::release::ReleaseAttributes;
use regex::Regex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use crate::{ConfigError, ConfigResult};

// {{.Field}} with optional whitespace
static FIELD_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*\.([A-Za-z][A-Za-z0-9]*)\s*\}\}").unwrap());

// @{{variable}}
static SCOPED_VAR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@\{\{\s*([A-Za-z0-9_][A-Za-z0-9_.\-]*)\s*\}\}").unwrap());

/// Fields available to an image descriptor template.
#[derive(Debug, Clone)]
pub struct ReleaseTemplate<'a> {
    attrs: &'a ReleaseAttributes,
}

impl<'a> ReleaseTemplate<'a> {
    pub fn new(attrs: &'a ReleaseAttributes) -> Self {
        Self { attrs }
    }

    fn resolve(&self, field: &str) -> Option<String> {
        let a = self.attrs;
        match field {
            "Name" => Some(a.name.clone()),
            "Tag" => Some(a.tag.clone()),
            "PipelineName" => Some(a.pipeline_name.clone()),
            "ReleaseVersion" => Some(a.release_version.to_string()),
            "DeploymentType" => Some(a.deployment_type.clone()),
            "App" => Some(a.app.clone()),
            "Env" => Some(a.env.clone()),
            "AppMetrics" => Some(a.app_metrics.to_string()),
            _ => None,
        }
    }

    /// Substitute every known field. Unknown fields are kept as written.
    pub fn render(&self, template: &str) -> String {
        FIELD_REGEX
            .replace_all(template, |caps: &regex::Captures| {
                self.resolve(&caps[1])
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .to_string()
    }

    /// Render and parse the result as a JSON object.
    pub fn render_json(&self, template: &str) -> ConfigResult<Value> {
        let rendered = self.render(template);
        let value: Value = serde_json::from_str(&rendered)
            .map_err(|e| ConfigError::Template(format!("image descriptor is not JSON: {e}")))?;
        if !value.is_object() {
            return Err(ConfigError::Template(
                "image descriptor must render to a JSON object".to_string(),
            ));
        }
        Ok(value)
    }
}

/// Names of all scoped variables referenced anywhere in `value`.
pub fn referenced_variables(value: &Value) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    collect_variables(value, &mut names);
    names
}

fn collect_variables(value: &Value, names: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            for caps in SCOPED_VAR_REGEX.captures_iter(s) {
                names.insert(caps[1].to_string());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_variables(v, names)),
        Value::Object(map) => map.values().for_each(|v| collect_variables(v, names)),
        _ => {}
    }
}

/// Replace scoped variables in `value`.
///
/// A string that is exactly one placeholder takes the variable's JSON type
/// (`"@{{replicas}}"` with `replicas = 3` becomes the number 3). Placeholders
/// embedded in longer strings are substituted textually. Variables missing
/// from `values` are left in place.
pub fn substitute_variables(value: &Value, values: &BTreeMap<String, String>) -> Value {
    match value {
        Value::String(s) => substitute_in_string(s, values),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| substitute_variables(v, values))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_variables(v, values)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_in_string(s: &str, values: &BTreeMap<String, String>) -> Value {
    if let Some(caps) = SCOPED_VAR_REGEX.captures(s) {
        let whole = caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len());
        if whole {
            if let Some(raw) = values.get(&caps[1]) {
                return serde_json::from_str::<Value>(raw)
                    .ok()
                    .filter(|v| !v.is_object() && !v.is_array())
                    .unwrap_or_else(|| Value::String(raw.clone()));
            }
        }
    }
    let replaced = SCOPED_VAR_REGEX.replace_all(s, |caps: &regex::Captures| {
        values
            .get(&caps[1])
            .cloned()
            .unwrap_or_else(|| caps[0].to_string())
    });
    Value::String(replaced.into_owned())
}
