//! ArgoCD application client over the ArgoCD REST API.

use async_trait::async_trait;
use deckhand_core::Result;
use deckhand_core::deployer::{ArgoApplication, ArgoCdClient, PatchType};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::ClientError;

const SERVICE: &str = "argocd";

/// Extract the fields deckhand tracks from an ArgoCD `Application`.
pub fn application_from_json(name: &str, app: &Value) -> ArgoApplication {
    let source = &app["spec"]["source"];
    let text = |v: &Value| v.as_str().unwrap_or_default().to_string();
    let automated = &app["spec"]["syncPolicy"]["automated"];
    ArgoApplication {
        name: name.to_string(),
        repo_url: text(&source["repoURL"]),
        target_revision: text(&source["targetRevision"]),
        path: text(&source["path"]),
        auto_sync: automated.is_object(),
    }
}

pub struct ArgoCdRestClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl ArgoCdRestClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn app_url(&self, app_name: &str) -> String {
        format!(
            "{}/api/v1/applications/{}",
            self.base_url,
            urlencoding::encode(app_name)
        )
    }

    async fn check(response: reqwest::Response) -> std::result::Result<reqwest::Response, ClientError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(ClientError::from_response(SERVICE, response).await)
        }
    }
}

#[async_trait]
impl ArgoCdClient for ArgoCdRestClient {
    async fn get(&self, app_name: &str) -> Result<Option<ArgoApplication>> {
        let response = self
            .client
            .get(self.app_url(app_name))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Value = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))?;
        Ok(Some(application_from_json(app_name, &body)))
    }

    async fn patch(&self, app_name: &str, patch: &Value, patch_type: PatchType) -> Result<()> {
        let patch_type = match patch_type {
            PatchType::Merge => "merge",
            PatchType::Json => "json",
        };
        let body = json!({
            "name": app_name,
            "patch": patch.to_string(),
            "patchType": patch_type,
        });
        let response = self
            .client
            .patch(self.app_url(app_name))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;
        Self::check(response).await?;
        debug!(app = app_name, patch_type, "Patched argocd application");
        Ok(())
    }

    async fn sync(&self, app_name: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/sync", self.app_url(app_name)))
            .bearer_auth(&self.token)
            .json(&json!({"prune": true}))
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;
        Self::check(response).await?;
        info!(app = app_name, "Synced argocd application");
        Ok(())
    }
}
