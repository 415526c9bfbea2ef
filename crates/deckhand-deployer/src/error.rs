//! Errors raised by the HTTP clients.

use deckhand_core::Error;
use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The request never reached the remote side.
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("{service} returned {status}: {body}")]
    Api {
        service: &'static str,
        status: StatusCode,
        body: String,
    },

    #[error("parse error: {0}")]
    Parse(String),
}

impl ClientError {
    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            ClientError::Connect(err.to_string())
        } else {
            ClientError::Request(err.to_string())
        }
    }

    pub(crate) async fn from_response(service: &'static str, response: reqwest::Response) -> Self {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        ClientError::Api {
            service,
            status,
            body,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Api { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

impl From<ClientError> for Error {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Connect(msg) => Error::Connection(msg),
            ClientError::Api { status, .. } if status == StatusCode::NOT_FOUND => {
                Error::NotFound(err.to_string())
            }
            ClientError::Api { status, .. } if status == StatusCode::CONFLICT => {
                Error::Conflict(err.to_string())
            }
            ClientError::Api { .. } | ClientError::Request(_) => {
                Error::DeploymentFailed(err.to_string())
            }
            ClientError::Parse(msg) => Error::Internal(msg),
        }
    }
}
