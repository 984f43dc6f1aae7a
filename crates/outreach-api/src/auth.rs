//! Shared handler state and webhook signature verification

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use outreach_core::OutreachCore;
use outreach_storage::DatabasePool;
use sha2::Sha256;
use std::sync::Arc;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex>` of the raw request body
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<OutreachCore>,
    /// Webhook signing secret; signatures are not checked when unset
    pub signing_secret: Option<String>,
    /// Present for the postgres backend, used by readiness checks
    pub db_pool: Option<DatabasePool>,
}

impl AppState {
    pub fn new(core: Arc<OutreachCore>) -> Self {
        Self {
            core,
            signing_secret: None,
            db_pool: None,
        }
    }

    pub fn with_signing_secret(mut self, secret: Option<String>) -> Self {
        self.signing_secret = secret.filter(|s| !s.is_empty());
        self
    }

    pub fn with_db_pool(mut self, pool: DatabasePool) -> Self {
        self.db_pool = Some(pool);
        self
    }
}

/// Compute the header value for `body` under `secret`
pub fn sign(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Check a `sha256=<hex>` signature in constant time
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(hex_digest) = header.trim().strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Whether the request may be processed under the configured secret
pub fn authorize_webhook(state: &AppState, headers: &HeaderMap, body: &[u8]) -> bool {
    let Some(secret) = state.signing_secret.as_deref() else {
        return true;
    };

    match headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) {
        Some(signature) if verify_signature(secret, body, signature) => true,
        Some(_) => {
            warn!("Webhook signature mismatch");
            false
        }
        None => {
            warn!("Webhook signature missing");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let body = br#"{"event_type":"opened"}"#;
        let signature = sign("s3cret", body).unwrap();

        assert!(signature.starts_with("sha256="));
        assert!(verify_signature("s3cret", body, &signature));
        assert!(!verify_signature("other", body, &signature));
        assert!(!verify_signature("s3cret", b"{}", &signature));
        assert!(!verify_signature("s3cret", body, "sha256=zz"));
        assert!(!verify_signature("s3cret", body, signature.trim_start_matches("sha256=")));
    }
}
