//! Registry credentials.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// A secret string that never shows up in logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretString(***)")
    }
}

/// A container registry known to the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerRegistry {
    pub id: String,
    /// Host (and optional port) images are pushed to, e.g. `r.io`.
    pub registry_url: String,
    pub registry_type: String,
    pub username: String,
    pub password: SecretString,
}

impl DockerRegistry {
    /// `host/repository` in this registry, without a tag.
    pub fn repository_path(&self, repository: &str) -> String {
        let host = self
            .registry_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        format!("{}/{}", host, repository.trim_matches('/'))
    }

    /// Full image path for `repository:tag` in this registry.
    pub fn image_path(&self, repository: &str, tag: &str) -> String {
        format!("{}:{}", self.repository_path(repository), tag)
    }
}

/// Registry catalog lookups.
#[async_trait]
pub trait RegistryCatalog: Send + Sync {
    async fn get(&self, registry_id: &str) -> Result<DockerRegistry>;

    /// Name of the pull secret to inject for an image from `registry_id`
    /// deployed to `env_id`, if the registry has stored credentials for it.
    async fn image_pull_secret(&self, registry_id: &str, env_id: i64) -> Result<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_redacted() {
        let secret = SecretString::new("hunter2");
        assert_eq!(format!("{:?}", secret), "SecretString(***)");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_image_path_strips_scheme() {
        let registry = DockerRegistry {
            id: "dest".to_string(),
            registry_url: "https://r.io/".to_string(),
            registry_type: "docker-hub".to_string(),
            username: "ci".to_string(),
            password: SecretString::new("x"),
        };
        assert_eq!(registry.image_path("dest", "build-7"), "r.io/dest:build-7");
    }
}
