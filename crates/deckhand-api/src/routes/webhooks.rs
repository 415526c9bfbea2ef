//! Webhook endpoints for external CI systems.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use deckhand_core::ArtifactId;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};

use crate::AppState;
use crate::error::ApiError;

pub const SIGNATURE_HEADER: &str = "X-Deckhand-Signature-256";

pub fn router() -> Router<AppState> {
    Router::new().route("/ext-ci/{external_ci_id}", post(external_ci_webhook))
}

/// An artifact an external CI system already registered.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalCiPayload {
    pub ci_artifact_id: ArtifactId,
    pub triggered_by: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalCiResponse {
    pub triggered: usize,
}

async fn external_ci_webhook(
    State(state): State<AppState>,
    Path(external_ci_id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<ExternalCiResponse>), ApiError> {
    if let Some(secret) = state.webhook_secret.as_deref() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        if !verify_signature(secret, &body, signature) {
            warn!(external_ci_id, "Invalid webhook signature");
            return Err(ApiError::Unauthorized("invalid webhook signature".to_string()));
        }
    }

    let payload: ExternalCiPayload = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e)))?;
    info!(
        external_ci_id,
        artifact_id = %payload.ci_artifact_id,
        "Received external CI webhook"
    );

    let started = state
        .orchestrator
        .handle_webhook_external_ci(
            payload.ci_artifact_id,
            external_ci_id,
            payload.triggered_by,
            None,
            &|_| true,
        )
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ExternalCiResponse {
            triggered: started.len(),
        }),
    ))
}

/// Verify an `X-Deckhand-Signature-256` header of the form `sha256=<hex>`.
fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };

    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    mac.verify_slice(&sig_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_valid_signature() {
        let body = br#"{"ciArtifactId":42,"triggeredBy":1}"#;
        let header = sign("s3cret", body);
        assert!(verify_signature("s3cret", body, Some(&header)));
    }

    #[test]
    fn test_rejects_tampered_body_and_wrong_key() {
        let body = br#"{"ciArtifactId":42,"triggeredBy":1}"#;
        let header = sign("s3cret", body);
        assert!(!verify_signature("s3cret", br#"{"ciArtifactId":43,"triggeredBy":1}"#, Some(&header)));
        assert!(!verify_signature("other", body, Some(&header)));
    }

    #[test]
    fn test_rejects_missing_or_malformed_header() {
        let body = b"{}";
        assert!(!verify_signature("s3cret", body, None));
        assert!(!verify_signature("s3cret", body, Some("md5=abcd")));
        assert!(!verify_signature("s3cret", body, Some("sha256=not-hex")));
    }
}
