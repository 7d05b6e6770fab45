//! API-key authentication.
//!
//! Callers send `Authorization: Bearer <key>`; the stored form is a salted
//! HMAC-SHA-256 of the key so a leaked database never yields usable keys.
//! Every key carries a tenant tag, which scopes all subsequent operations.
//! `/health` and `/metrics` stay open; internal routes use the shared
//! secret header instead.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::runner::wire::INTERNAL_SECRET_HEADER;
use crate::store::models::{ApiKey, DEFAULT_TENANT, now_rfc3339};
use crate::store::SharedStore;

/// Domain-separation salt for stored key hashes.
const KEY_SALT: &[u8] = b"ash:api-key:v1";

/// Tenant resolved for the current request.
#[derive(Debug, Clone)]
pub struct CurrentTenant(pub String);

/// Auth configuration + store handle shared with the middleware.
#[derive(Clone)]
pub struct AuthState {
    store: SharedStore,
    /// Auth is enforced only when at least one key is configured.
    enabled: bool,
    internal_secret: Option<String>,
}

impl AuthState {
    pub fn new(store: SharedStore, enabled: bool, internal_secret: Option<String>) -> Self {
        Self {
            store,
            enabled,
            internal_secret,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Hash and upsert the primary key from `ASH_API_KEY`.
    pub async fn seed_primary_key(store: &SharedStore, key: &str) -> Result<(), crate::store::StoreError> {
        let row = ApiKey {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: DEFAULT_TENANT.to_string(),
            key_hash: hash_api_key(key),
            label: "primary".to_string(),
            created_at: now_rfc3339(),
        };
        store.upsert_api_key(&row).await
    }

    /// Validate the shared internal secret header.
    pub fn check_internal(&self, request: &Request) -> bool {
        match &self.internal_secret {
            None => true,
            Some(secret) => request
                .headers()
                .get(INTERNAL_SECRET_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(|v| v == secret)
                .unwrap_or(false),
        }
    }
}

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA-256 with the storage salt as key.
pub fn hash_api_key(key: &str) -> String {
    hex::encode(hmac_sha256(KEY_SALT, key.as_bytes()))
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(serde_json::json!({ "error": message, "code": "UNAUTHORIZED" })),
    )
        .into_response()
}

/// Bearer-token middleware for the external API.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    if !auth.enabled {
        request
            .extensions_mut()
            .insert(CurrentTenant(DEFAULT_TENANT.to_string()));
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return unauthorized("missing bearer token");
    };

    match auth.store.find_api_key_by_hash(&hash_api_key(token)).await {
        Ok(Some(key)) => {
            request.extensions_mut().insert(CurrentTenant(key.tenant_id));
            next.run(request).await
        }
        Ok(None) => unauthorized("invalid API key"),
        Err(e) => {
            log::error!("API key lookup failed: {}", e);
            unauthorized("authentication unavailable")
        }
    }
}

/// Shared-secret middleware for internal routes.
pub async fn internal_auth_middleware(
    State(auth): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    if !auth.check_internal(&request) {
        return unauthorized("invalid internal secret");
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::Digest;

    #[test]
    fn test_hash_is_deterministic_and_salted() {
        let a = hash_api_key("sk-ash-12345");
        let b = hash_api_key("sk-ash-12345");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        // Raw digest of the key must differ from the salted form.
        let raw = hex::encode(Sha256::digest(b"sk-ash-12345"));
        assert_ne!(a, raw);
    }

    #[test]
    fn test_hmac_long_key() {
        let long_key = vec![0xabu8; 100];
        let short_key = Sha256::digest(&long_key);
        // RFC 2104: keys longer than the block are hashed first.
        assert_eq!(
            hmac_sha256(&long_key, b"msg"),
            hmac_sha256(&short_key, b"msg")
        );
    }

    #[test]
    fn test_different_keys_different_hashes() {
        assert_ne!(hash_api_key("key-a"), hash_api_key("key-b"));
    }
}
