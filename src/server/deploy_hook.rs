//! Deployment platform webhook: verified events become `deploy_events` rows
//! for the deploy correlator.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use crate::db;
use crate::db::models::NewDeployEvent;
use crate::engine::deploy::map_ready_state;
use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

/// Signature headers checked in order.
pub const SIGNATURE_HEADERS: &[&str] = &["x-vercel-signature", "x-signature-256", "x-hub-signature-256"];

/// Verify an HMAC-SHA256 signature given as hex, with or without a
/// `sha256=` prefix.
pub fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let hex_sig = signature.trim().strip_prefix("sha256=").unwrap_or(signature.trim());
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Meta {
    github_commit_sha: Option<String>,
    github_commit_message: Option<String>,
    github_commit_ref: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Deployment {
    id: Option<String>,
    url: Option<String>,
    ready_state: Option<String>,
    #[serde(default)]
    meta: Meta,
}

/// Fields of interest, accepted either wrapped (`{type, payload: {deployment}}`)
/// or flat.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Payload {
    deployment: Option<Deployment>,
    id: Option<String>,
    deployment_id: Option<String>,
    url: Option<String>,
    ready_state: Option<String>,
    meta: Option<Meta>,
    created_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    payload: Option<Payload>,
    #[serde(flatten)]
    flat: Payload,
}

/// Turn a webhook body into a deploy event.
pub fn parse_event(body: &[u8]) -> Result<NewDeployEvent, AppError> {
    let envelope: Envelope =
        serde_json::from_slice(body).map_err(|e| AppError::Validation(format!("invalid deploy payload: {e}")))?;
    let kind = envelope.kind;
    let payload = envelope.payload.unwrap_or(envelope.flat);
    let deployment = payload.deployment.unwrap_or_default();
    let meta = payload.meta.unwrap_or_default();

    let deployment_id = deployment
        .id
        .or(payload.id)
        .or(payload.deployment_id)
        .ok_or_else(|| AppError::Validation("deploy payload has no deployment id".into()))?;

    let raw_state = deployment
        .ready_state
        .or(payload.ready_state)
        .or(kind)
        .unwrap_or_default();

    let deployed_at = payload
        .created_at
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(db::timestamp)
        .unwrap_or_else(db::now);

    Ok(NewDeployEvent {
        deployment_id,
        commit_sha: deployment.meta.github_commit_sha.or(meta.github_commit_sha),
        commit_message: deployment.meta.github_commit_message.or(meta.github_commit_message),
        branch: deployment.meta.github_commit_ref.or(meta.github_commit_ref),
        status: map_ready_state(&raw_state).to_string(),
        url: deployment
            .url
            .or(payload.url)
            .map(|u| if u.starts_with("http") { u } else { format!("https://{u}") }),
        deployed_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_signature_verification() {
        let body = br#"{"id":"dpl_1"}"#;
        let sig = sign("hook-secret", body);
        assert!(verify_signature("hook-secret", body, &sig));
        assert!(verify_signature("hook-secret", body, &format!("sha256={sig}")));
        assert!(!verify_signature("other", body, &sig));
        assert!(!verify_signature("hook-secret", b"tampered", &sig));
        assert!(!verify_signature("hook-secret", body, "not-hex"));
    }

    #[test]
    fn test_parse_wrapped_payload() {
        let body = serde_json::json!({
            "type": "deployment.succeeded",
            "payload": {
                "deployment": {
                    "id": "dpl_abc",
                    "url": "shop-abc.vercel.app",
                    "meta": {
                        "githubCommitSha": "0a1b2c3d4e",
                        "githubCommitMessage": "fix checkout",
                        "githubCommitRef": "main"
                    }
                },
                "createdAt": 1767225600000i64
            }
        });
        let event = parse_event(body.to_string().as_bytes()).unwrap();
        assert_eq!(event.deployment_id, "dpl_abc");
        assert_eq!(event.status, "ready");
        assert_eq!(event.commit_sha.as_deref(), Some("0a1b2c3d4e"));
        assert_eq!(event.branch.as_deref(), Some("main"));
        assert_eq!(event.url.as_deref(), Some("https://shop-abc.vercel.app"));
        assert_eq!(event.deployed_at, "2026-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_parse_flat_payload_prefers_ready_state() {
        let body = br#"{"type":"deployment","id":"dpl_flat","readyState":"ERROR","meta":{"githubCommitRef":"hotfix"}}"#;
        let event = parse_event(body).unwrap();
        assert_eq!(event.deployment_id, "dpl_flat");
        assert_eq!(event.status, "error");
        assert_eq!(event.branch.as_deref(), Some("hotfix"));
    }

    #[test]
    fn test_parse_rejects_missing_id_or_garbage() {
        assert!(parse_event(br#"{"type":"deployment.created","payload":{}}"#).is_err());
        assert!(parse_event(b"not json").is_err());
    }
}
