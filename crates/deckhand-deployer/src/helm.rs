//! HTTP client for the cluster-adjacent Helm executor.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use deckhand_core::Result;
use deckhand_core::deployer::{HelmAppIdentifier, HelmClient, HelmReleaseRequest, ReleaseStatus};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::ClientError;

const SERVICE: &str = "helm executor";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstallBody<'a> {
    cluster_id: i64,
    namespace: &'a str,
    release_name: &'a str,
    chart_name: &'a str,
    chart_version: &'a str,
    values_yaml: &'a str,
    /// Packaged chart, base64 encoded.
    chart_content: String,
}

impl<'a> InstallBody<'a> {
    fn new(request: &'a HelmReleaseRequest) -> Self {
        Self {
            cluster_id: request.app.cluster_id,
            namespace: &request.app.namespace,
            release_name: &request.app.release_name,
            chart_name: &request.chart_name,
            chart_version: &request.chart_version,
            values_yaml: &request.values_yaml,
            chart_content: STANDARD.encode(&request.chart_content),
        }
    }
}

/// Helm executor reached over HTTP.
pub struct HttpHelmClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpHelmClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn release_url(&self, app: &HelmAppIdentifier) -> String {
        format!(
            "{}/releases/{}/{}/{}",
            self.base_url,
            app.cluster_id,
            urlencoding::encode(&app.namespace),
            urlencoding::encode(&app.release_name)
        )
    }

    async fn send_release(&self, url: String, request: &HelmReleaseRequest) -> Result<()> {
        let response = self
            .client
            .post(&url)
            .json(&InstallBody::new(request))
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;
        if !response.status().is_success() {
            return Err(ClientError::from_response(SERVICE, response).await.into());
        }
        Ok(())
    }
}

#[async_trait]
impl HelmClient for HttpHelmClient {
    async fn install_release_with_custom_chart(&self, request: &HelmReleaseRequest) -> Result<()> {
        info!(release = %request.app.release_name, chart = %request.chart_name, "Installing helm release");
        self.send_release(format!("{}/releases/install", self.base_url), request)
            .await
    }

    async fn update_application(&self, request: &HelmReleaseRequest) -> Result<()> {
        info!(release = %request.app.release_name, "Upgrading helm release");
        let url = format!("{}/upgrade", self.release_url(&request.app));
        self.send_release(url, request).await
    }

    async fn get_application_and_release_status(
        &self,
        app: &HelmAppIdentifier,
    ) -> Result<Option<ReleaseStatus>> {
        let response = self
            .client
            .get(format!("{}/status", self.release_url(app)))
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(release = %app.release_name, "Release not found");
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ClientError::from_response(SERVICE, response).await.into());
        }
        let status = response
            .json::<ReleaseStatus>()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))?;
        Ok(Some(status))
    }
}
