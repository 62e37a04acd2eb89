//! Session-token authentication for the `/api/*` management plane.
//!
//! Control-plane callers present `Authorization: Bearer <JWT>` — an HS256
//! access token with claims `{sub, org_id, role, type: "access", exp}`.
//! Token minting (login, refresh rotation) lives in the identity service;
//! this middleware only validates and injects the authenticated principal.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::GatewayError, state::AppState};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// User ID.
    pub sub: String,
    pub org_id: String,
    pub role: String,
    /// `"access"` or `"refresh"`; only access tokens authenticate requests.
    #[serde(rename = "type")]
    pub token_type: String,
    pub exp: i64,
}

/// Request extension carrying the authenticated control-plane principal.
#[derive(Debug, Clone)]
pub struct SessionUser {
    pub user_id: Uuid,
    pub org_id: Uuid,
    pub role: String,
}

/// Validate a bearer JWT into a [`SessionUser`].
pub fn verify_token(token: &str, secret: &str) -> Result<SessionUser, GatewayError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;

    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| GatewayError::Auth(format!("invalid session token: {e}")))?;

    if data.claims.token_type != "access" {
        return Err(GatewayError::Auth(
            "refresh tokens cannot authenticate requests".into(),
        ));
    }
    let user_id = Uuid::parse_str(&data.claims.sub)
        .map_err(|_| GatewayError::Auth("malformed subject claim".into()))?;
    let org_id = Uuid::parse_str(&data.claims.org_id)
        .map_err(|_| GatewayError::Auth("malformed org claim".into()))?;

    Ok(SessionUser {
        user_id,
        org_id,
        role: data.claims.role,
    })
}

/// Axum middleware guarding every management route.
pub async fn session_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .extensions()
        .get::<super::admission::RequestId>()
        .map(|id| id.0.clone());

    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return GatewayError::Auth("missing Authorization: Bearer header".into())
            .into_envelope(request_id.as_deref(), false);
    };

    match verify_token(token, &state.settings.secret_key) {
        Ok(user) => {
            req.extensions_mut().insert(user.clone());
            let mut response = next.run(req).await;
            // Surfaced on the response for the audit middleware, which runs
            // outside this layer.
            response.extensions_mut().insert(user);
            response
        }
        Err(err) => err.into_envelope(request_id.as_deref(), false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn token_with(token_type: &str, exp_offset_secs: i64) -> String {
        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            org_id: Uuid::new_v4().to_string(),
            role: "admin".into(),
            token_type: token_type.into(),
            exp: chrono::Utc::now().timestamp() + exp_offset_secs,
        };
        jsonwebtoken::encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_access_token_is_accepted() {
        let user = verify_token(&token_with("access", 1800), SECRET).unwrap();
        assert_eq!(user.role, "admin");
    }

    #[test]
    fn expired_token_is_rejected() {
        let err = verify_token(&token_with("access", -3600), SECRET).unwrap_err();
        assert!(matches!(err, GatewayError::Auth(_)));
    }

    #[test]
    fn refresh_token_cannot_authenticate() {
        let err = verify_token(&token_with("refresh", 1800), SECRET).unwrap_err();
        assert!(matches!(err, GatewayError::Auth(_)));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let err = verify_token(&token_with("access", 1800), "other-secret").unwrap_err();
        assert!(matches!(err, GatewayError::Auth(_)));
    }

    #[test]
    fn garbage_token_is_rejected() {
        assert!(verify_token("not-a-jwt", SECRET).is_err());
    }
}
