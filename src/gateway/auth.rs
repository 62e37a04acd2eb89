//! Gateway key authentication.
//!
//! Raw keys have the form `bn-<base32 alphabet, ≥15 chars>`. The server never
//! stores a raw key: the row keeps `key_prefix` (public, for UI display and
//! routing-policy binding) and the SHA-256 hex digest of the whole token.
//! Lookup is by digest; comparing hashes makes timing attacks on the lookup
//! itself pointless.
//!
//! The middleware resolves the bearer token to a [`GatewayKey`] row and
//! injects it as a request extension. The per-request model allow-list is
//! enforced later in the pipeline, once the JSON body has been decoded.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use rand::Rng as _;
use sha2::{Digest, Sha256};

use crate::{db::models::GatewayKey, error::GatewayError, state::AppState};

/// Display prefix length retained on the row (includes the `bn-` marker).
pub const KEY_PREFIX_LEN: usize = 12;

/// RFC 4648 base32 alphabet (lowercase), the key body charset.
const KEY_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Random characters in a freshly minted key body.
const KEY_BODY_LEN: usize = 30;

/// Minimum body length accepted on inbound tokens.
const MIN_BODY_LEN: usize = 15;

/// Request extension carrying the authenticated key.
#[derive(Clone)]
pub struct AuthenticatedKey(pub Arc<GatewayKey>);

/// A newly minted key. `plaintext` is returned to the caller exactly once;
/// only `hash` and `prefix` are persisted.
pub struct MintedKey {
    pub plaintext: String,
    pub hash: String,
    pub prefix: String,
}

/// Generate a fresh gateway key.
pub fn mint_key() -> MintedKey {
    let mut rng = rand::rng();
    let body: String = (0..KEY_BODY_LEN)
        .map(|_| KEY_ALPHABET[rng.random_range(0..KEY_ALPHABET.len())] as char)
        .collect();
    let plaintext = format!("bn-{body}");
    MintedKey {
        hash: hash_token(&plaintext),
        prefix: plaintext[..KEY_PREFIX_LEN].to_string(),
        plaintext,
    }
}

/// SHA-256 hex digest of a raw token.
pub fn hash_token(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Syntactic check before any I/O: `bn-` marker plus a base32 body of at
/// least [`MIN_BODY_LEN`] characters.
pub fn well_formed(token: &str) -> bool {
    let Some(body) = token.strip_prefix("bn-") else {
        return false;
    };
    body.len() >= MIN_BODY_LEN && body.bytes().all(|b| KEY_ALPHABET.contains(&b))
}

/// Resolve a bearer token to its key row.
pub async fn authenticate(db: &sqlx::PgPool, token: &str) -> Result<GatewayKey, GatewayError> {
    if !well_formed(token) {
        return Err(GatewayError::InvalidKey("invalid API key".into()));
    }
    let key = crate::db::keys::find_by_hash(db, &hash_token(token))
        .await
        .map_err(|e| GatewayError::ServiceUnavailable(format!("key lookup failed: {e}")))?
        .ok_or_else(|| GatewayError::InvalidKey("invalid API key".into()))?;

    if key.revoked_at.is_some() {
        return Err(GatewayError::InvalidKey("API key has been revoked".into()));
    }
    Ok(key)
}

/// Enforce the key's model allow-list, when one is set.
pub fn ensure_model_allowed(key: &GatewayKey, model: &str) -> Result<(), GatewayError> {
    match key.allowed_model_list() {
        Some(allowed) if !allowed.iter().any(|m| m == model) => Err(GatewayError::Forbidden(
            format!("model `{model}` is not allowed for this key"),
        )),
        _ => Ok(()),
    }
}

/// Axum middleware guarding every `/v1/*` route.
pub async fn key_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);

    let Some(token) = token else {
        return GatewayError::InvalidKey("missing Authorization: Bearer header".into())
            .into_envelope(request_id_of(&req), true);
    };

    match authenticate(&state.db, &token).await {
        Ok(key) => {
            let principal = AuthenticatedKey(Arc::new(key));
            req.extensions_mut().insert(principal.clone());
            let mut response = next.run(req).await;
            // Surfaced on the response for the audit middleware, which runs
            // outside this layer.
            response.extensions_mut().insert(principal);
            response
        }
        Err(err) => err.into_envelope(request_id_of(&req), true),
    }
}

fn request_id_of(req: &Request) -> Option<&str> {
    req.extensions()
        .get::<crate::api::admission::RequestId>()
        .map(|id| id.0.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Key minting
    // -----------------------------------------------------------------------

    #[test]
    fn minted_key_round_trips_through_hash_and_prefix() {
        let minted = mint_key();
        assert!(minted.plaintext.starts_with("bn-"));
        assert_eq!(hash_token(&minted.plaintext), minted.hash);
        assert_eq!(&minted.plaintext[..KEY_PREFIX_LEN], minted.prefix);
        assert!(well_formed(&minted.plaintext));
    }

    #[test]
    fn minted_keys_are_distinct() {
        let a = mint_key();
        let b = mint_key();
        assert_ne!(a.plaintext, b.plaintext);
        assert_ne!(a.hash, b.hash);
    }

    #[test]
    fn hash_is_hex_sha256() {
        let hash = hash_token("bn-abcdefghijklmnop");
        assert_eq!(hash.len(), 64);
        assert!(hash.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    // -----------------------------------------------------------------------
    // Token format
    // -----------------------------------------------------------------------

    #[test]
    fn well_formed_accepts_valid_tokens() {
        assert!(well_formed("bn-abcdefghijklmnop234567"));
    }

    #[test]
    fn well_formed_rejects_wrong_marker_short_body_and_bad_charset() {
        assert!(!well_formed("sk-abcdefghijklmnop"));
        assert!(!well_formed("bn-short"));
        assert!(!well_formed("bn-ABCDEFGHIJKLMNOP")); // uppercase not in alphabet
        assert!(!well_formed("bn-abcdefghijklmn0p234")); // 0 and 1 excluded from base32
        assert!(!well_formed(""));
    }

    // -----------------------------------------------------------------------
    // Allow-list
    // -----------------------------------------------------------------------

    fn key_with_allowed(allowed: Option<serde_json::Value>) -> GatewayKey {
        GatewayKey {
            id: uuid::Uuid::new_v4(),
            org_id: uuid::Uuid::new_v4(),
            key_hash: "h".into(),
            key_prefix: "bn-abc123def".into(),
            name: "test".into(),
            team_id: None,
            rate_limit: 60,
            allowed_models: allowed,
            created_at: chrono::Utc::now(),
            revoked_at: None,
        }
    }

    #[test]
    fn unrestricted_key_allows_any_model() {
        let key = key_with_allowed(None);
        assert!(ensure_model_allowed(&key, "gpt-4o").is_ok());
    }

    #[test]
    fn allow_list_blocks_other_models_with_403() {
        let key = key_with_allowed(Some(serde_json::json!({ "models": ["gpt-4o"] })));
        assert!(ensure_model_allowed(&key, "gpt-4o").is_ok());
        let err = ensure_model_allowed(&key, "claude-3-5-sonnet").unwrap_err();
        assert!(matches!(err, GatewayError::Forbidden(_)));
    }
}
