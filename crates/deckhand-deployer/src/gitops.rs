//! GitOps values commits through the GitHub contents API.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use deckhand_core::deployer::{CommitInfo, GitOpsClient, ValuesCommit};
use deckhand_core::{Error, Result};
use serde::Deserialize;
use tracing::info;
use url::Url;

use crate::error::ClientError;

const SERVICE: &str = "git provider";
const USER_AGENT: &str = "deckhand-cd";

#[derive(Debug, Deserialize)]
struct ContentFile {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct CommitAuthor {
    date: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct CommitDetails {
    sha: String,
    committer: CommitAuthor,
}

#[derive(Debug, Deserialize)]
struct PutContentResponse {
    commit: CommitDetails,
}

/// `owner/repo` of a GitHub repository URL.
pub fn repo_slug(repo_url: &str) -> Result<String> {
    let url = Url::parse(repo_url)
        .map_err(|e| Error::InvalidInput(format!("invalid gitops repo url {repo_url}: {e}")))?;
    let mut segments = url
        .path_segments()
        .map(|s| s.filter(|p| !p.is_empty()).collect::<Vec<_>>())
        .unwrap_or_default();
    if segments.len() != 2 {
        return Err(Error::InvalidInput(format!(
            "gitops repo url {repo_url} is not of the form <host>/<owner>/<repo>"
        )));
    }
    let repo = segments.pop().unwrap_or_default().trim_end_matches(".git");
    let owner = segments.pop().unwrap_or_default();
    Ok(format!("{owner}/{repo}"))
}

/// Commits values files into GitHub-hosted GitOps repositories.
pub struct GitHubGitOpsClient {
    client: reqwest::Client,
    api_url: String,
    token: String,
}

impl GitHubGitOpsClient {
    pub fn new(api_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn contents_url(&self, slug: &str, path: &str) -> String {
        format!("{}/repos/{}/contents/{}", self.api_url, slug, path)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json")
    }

    /// Blob sha of the current file, if it exists.
    async fn existing_sha(&self, url: &str) -> Result<Option<String>> {
        let response = self
            .request(reqwest::Method::GET, url)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ClientError::from_response(SERVICE, response).await.into());
        }
        let file: ContentFile = response
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))?;
        Ok(Some(file.sha))
    }
}

#[async_trait]
impl GitOpsClient for GitHubGitOpsClient {
    async fn commit_values(&self, commit: &ValuesCommit) -> Result<CommitInfo> {
        let slug = repo_slug(&commit.repo_url)?;
        let path = format!(
            "{}/{}",
            commit.chart_location.trim_matches('/'),
            commit.file_name
        );
        let url = self.contents_url(&slug, &path);
        let sha = self.existing_sha(&url).await?;

        let mut body = serde_json::json!({
            "message": commit.message,
            "content": STANDARD.encode(commit.values_yaml.as_bytes()),
            "committer": {"name": commit.author_name, "email": commit.author_email},
            "author": {"name": commit.author_name, "email": commit.author_email},
        });
        if let Some(sha) = sha {
            body["sha"] = serde_json::Value::String(sha);
        }

        let response = self
            .request(reqwest::Method::PUT, &url)
            .json(&body)
            .send()
            .await
            .map_err(ClientError::from_reqwest)?;
        if !response.status().is_success() {
            return Err(ClientError::from_response(SERVICE, response).await.into());
        }
        let created: PutContentResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))?;

        info!(repo = %slug, path = %path, commit = %created.commit.sha, "Committed values");
        Ok(CommitInfo {
            hash: created.commit.sha,
            time: created.commit.committer.date,
        })
    }
}
