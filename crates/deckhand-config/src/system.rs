//! System configuration.
//!
//! Parsed from a KDL document, then overridden from the environment:
//!
//! ```kdl
//! chart-install-timeout-mins 15
//! async-helm-install #true
//! default-namespace "devtron-cd"
//! default-executor "AWF"
//! autoscaling {
//!     replica-count-path "spec.replicas"
//! }
//! queue {
//!     poll-interval-ms 500
//! }
//! ```

use deckhand_core::workflow::ExecutorType;
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{ConfigError, ConfigResult};

/// JSON paths of the autoscaling keys inside a chart's values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalingKeys {
    pub enabled_path: String,
    pub replica_count_path: String,
    pub min_replicas_path: String,
    pub max_replicas_path: String,
}

impl Default for AutoscalingKeys {
    fn default() -> Self {
        Self {
            enabled_path: "autoscaling.enabled".to_string(),
            replica_count_path: "replicaCount".to_string(),
            min_replicas_path: "autoscaling.MinReplicas".to_string(),
            max_replicas_path: "autoscaling.MaxReplicas".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitOpsSettings {
    /// Values files are named `<prefix><envId>-values.yaml`.
    pub values_file_prefix: String,
    /// Author email used when the triggering user has none.
    pub commit_author_fallback: String,
    /// ArgoCD applications sync themselves; no explicit sync is sent.
    pub auto_sync: bool,
}

impl Default for GitOpsSettings {
    fn default() -> Self {
        Self {
            values_file_prefix: "_".to_string(),
            commit_author_fallback: "admin@deckhand.local".to_string(),
            auto_sync: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub poll_interval: Duration,
    pub backoff: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            backoff: Duration::from_millis(5000),
        }
    }
}

/// How stage workflows are launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSettings {
    /// Image that interprets the stage request inside the workflow pod.
    pub runner_image: String,
    pub service_account: String,
    /// Upper bound on a stage's runtime, enforced by the executor.
    pub active_deadline: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            runner_image: "quay.io/devtron/ci-runner:latest".to_string(),
            service_account: "cd-runner".to_string(),
            active_deadline: Duration::from_secs(3 * 60 * 60),
        }
    }
}

/// Base URLs of the collaborators reached over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSettings {
    pub helm_url: String,
    pub argocd_url: String,
    pub git_api_url: String,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            helm_url: "http://kubelink-service:50051".to_string(),
            argocd_url: "https://argocd-server.devtroncd".to_string(),
            git_api_url: "https://api.github.com".to_string(),
        }
    }
}

/// Trigger-core configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdConfig {
    /// Deadline for a single Helm release.
    pub chart_install_timeout: Duration,
    /// Ship Helm releases through the async-chart-install topic.
    pub async_helm_install: bool,
    /// Namespace for stage workflows that do not run in the target env.
    pub default_namespace: String,
    pub default_executor: ExecutorType,
    pub log_location_prefix: String,
    /// Template name of the pod node in stage workflows.
    pub workflow_template_name: String,
    pub release_counter_retries: u32,
    pub autoscaling: AutoscalingKeys,
    pub gitops: GitOpsSettings,
    pub queue: QueueSettings,
    pub executor: ExecutorSettings,
    pub endpoints: EndpointSettings,
    pub listen_addr: String,
}

impl Default for CdConfig {
    fn default() -> Self {
        Self {
            chart_install_timeout: Duration::from_secs(15 * 60),
            async_helm_install: false,
            default_namespace: "devtron-cd".to_string(),
            default_executor: ExecutorType::ArgoWorkflow,
            log_location_prefix: "arsenal-v1".to_string(),
            workflow_template_name: "cd".to_string(),
            release_counter_retries: 5,
            autoscaling: AutoscalingKeys::default(),
            gitops: GitOpsSettings::default(),
            queue: QueueSettings::default(),
            executor: ExecutorSettings::default(),
            endpoints: EndpointSettings::default(),
            listen_addr: "0.0.0.0:3000".to_string(),
        }
    }
}

impl CdConfig {
    /// Load from an optional KDL file and the process environment.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => parse_cd_config(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        if let Some(v) = lookup("DEVTRON_CHART_INSTALL_REQUEST_TIMEOUT") {
            self.chart_install_timeout = minutes("DEVTRON_CHART_INSTALL_REQUEST_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("RUN_HELM_INSTALL_IN_ASYNC_MODE") {
            self.async_helm_install = parse_bool("RUN_HELM_INSTALL_IN_ASYNC_MODE", &v)?;
        }
        if let Some(v) = lookup("DEFAULT_CD_NAMESPACE") {
            self.default_namespace = v;
        }
        if let Some(v) = lookup("CD_DEFAULT_EXECUTOR") {
            self.default_executor = v
                .parse()
                .map_err(|e: String| ConfigError::invalid("CD_DEFAULT_EXECUTOR", e))?;
        }
        if let Some(v) = lookup("CD_LOG_LOCATION_PREFIX") {
            self.log_location_prefix = v;
        }
        if let Some(v) = lookup("CD_WORKFLOW_TEMPLATE") {
            self.workflow_template_name = v;
        }
        if let Some(v) = lookup("CUSTOM_AUTOSCALING_ENABLED_PATH") {
            self.autoscaling.enabled_path = v;
        }
        if let Some(v) = lookup("CUSTOM_AUTOSCALING_REPLICA_COUNT_PATH") {
            self.autoscaling.replica_count_path = v;
        }
        if let Some(v) = lookup("CUSTOM_AUTOSCALING_MIN_REPLICA_COUNT_PATH") {
            self.autoscaling.min_replicas_path = v;
        }
        if let Some(v) = lookup("CUSTOM_AUTOSCALING_MAX_REPLICA_COUNT_PATH") {
            self.autoscaling.max_replicas_path = v;
        }
        if let Some(v) = lookup("CD_RUNNER_IMAGE") {
            self.executor.runner_image = v;
        }
        if let Some(v) = lookup("HELM_EXECUTOR_URL") {
            self.endpoints.helm_url = v;
        }
        if let Some(v) = lookup("ARGOCD_URL") {
            self.endpoints.argocd_url = v;
        }
        if let Some(v) = lookup("GIT_API_URL") {
            self.endpoints.git_api_url = v;
        }
        if let Some(v) = lookup("DECKHAND_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        Ok(())
    }
}

/// Parse configuration from KDL text. Unset keys keep their defaults.
pub fn parse_cd_config(kdl: &str) -> ConfigResult<CdConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = CdConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "chart-install-timeout-mins" => {
                config.chart_install_timeout =
                    Duration::from_secs(get_u64_arg(node)? * 60);
            }
            "async-helm-install" => config.async_helm_install = get_bool_arg(node)?,
            "default-namespace" => config.default_namespace = get_string_arg(node)?,
            "default-executor" => {
                config.default_executor = get_string_arg(node)?
                    .parse()
                    .map_err(|e: String| ConfigError::invalid("default-executor", e))?;
            }
            "log-location-prefix" => config.log_location_prefix = get_string_arg(node)?,
            "workflow-template-name" => config.workflow_template_name = get_string_arg(node)?,
            "release-counter-retries" => {
                config.release_counter_retries = u32::try_from(get_u64_arg(node)?)
                    .map_err(|_| ConfigError::invalid("release-counter-retries", "too large"))?;
            }
            "listen-addr" => config.listen_addr = get_string_arg(node)?,
            "autoscaling" => {
                for child in children(node) {
                    let value = get_string_arg(child)?;
                    match child.name().value() {
                        "enabled-path" => config.autoscaling.enabled_path = value,
                        "replica-count-path" => config.autoscaling.replica_count_path = value,
                        "min-replicas-path" => config.autoscaling.min_replicas_path = value,
                        "max-replicas-path" => config.autoscaling.max_replicas_path = value,
                        other => return Err(unknown_key("autoscaling", other)),
                    }
                }
            }
            "gitops" => {
                for child in children(node) {
                    match child.name().value() {
                        "values-file-prefix" => {
                            config.gitops.values_file_prefix = get_string_arg(child)?
                        }
                        "commit-author-fallback" => {
                            config.gitops.commit_author_fallback = get_string_arg(child)?
                        }
                        "auto-sync" => config.gitops.auto_sync = get_bool_arg(child)?,
                        other => return Err(unknown_key("gitops", other)),
                    }
                }
            }
            "queue" => {
                for child in children(node) {
                    let millis = Duration::from_millis(get_u64_arg(child)?);
                    match child.name().value() {
                        "poll-interval-ms" => config.queue.poll_interval = millis,
                        "backoff-ms" => config.queue.backoff = millis,
                        other => return Err(unknown_key("queue", other)),
                    }
                }
            }
            "executor" => {
                for child in children(node) {
                    match child.name().value() {
                        "runner-image" => config.executor.runner_image = get_string_arg(child)?,
                        "service-account" => {
                            config.executor.service_account = get_string_arg(child)?
                        }
                        "active-deadline-mins" => {
                            config.executor.active_deadline =
                                Duration::from_secs(get_u64_arg(child)? * 60)
                        }
                        other => return Err(unknown_key("executor", other)),
                    }
                }
            }
            "endpoints" => {
                for child in children(node) {
                    let value = get_string_arg(child)?;
                    match child.name().value() {
                        "helm" => config.endpoints.helm_url = value,
                        "argocd" => config.endpoints.argocd_url = value,
                        "git-api" => config.endpoints.git_api_url = value,
                        other => return Err(unknown_key("endpoints", other)),
                    }
                }
            }
            other => return Err(unknown_key("config", other)),
        }
    }

    Ok(config)
}

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|c| c.nodes().iter())
}

fn unknown_key(section: &str, key: &str) -> ConfigError {
    ConfigError::invalid(section, format!("unknown key `{key}`"))
}

fn first_arg(node: &KdlNode) -> ConfigResult<&kdl::KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
        .ok_or_else(|| ConfigError::MissingField(node.name().value().to_string()))
}

fn get_string_arg(node: &KdlNode) -> ConfigResult<String> {
    first_arg(node)?
        .as_string()
        .map(|s| s.to_string())
        .ok_or_else(|| ConfigError::invalid(node.name().value(), "expected a string"))
}

fn get_u64_arg(node: &KdlNode) -> ConfigResult<u64> {
    first_arg(node)?
        .as_integer()
        .and_then(|i| u64::try_from(i).ok())
        .ok_or_else(|| ConfigError::invalid(node.name().value(), "expected a positive integer"))
}

fn get_bool_arg(node: &KdlNode) -> ConfigResult<bool> {
    let value = first_arg(node)?;
    if let Some(b) = value.as_bool() {
        return Ok(b);
    }
    match value.as_string() {
        Some(s) => parse_bool(node.name().value(), s),
        None => Err(ConfigError::invalid(node.name().value(), "expected a boolean")),
    }
}

fn parse_bool(field: &str, raw: &str) -> ConfigResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(ConfigError::invalid(field, format!("not a boolean: {other}"))),
    }
}

fn minutes(field: &str, raw: &str) -> ConfigResult<Duration> {
    raw.trim()
        .parse::<u64>()
        .map(|m| Duration::from_secs(m * 60))
        .map_err(|e| ConfigError::invalid(field, e.to_string()))
}
