//! Gateway key management (`/api/gateway/keys`).
//!
//! Creation returns the plaintext key exactly once; every later read shows
//! only the public prefix.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{error::GatewayError, gateway::auth, state::AppState};

use super::session_auth::SessionUser;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/gateway/keys", get(list_keys).post(create_key))
        .route("/api/gateway/keys/{key_id}", delete(revoke_key))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    name: String,
    #[serde(default)]
    team_id: Option<String>,
    #[serde(default = "default_rate_limit")]
    rate_limit: i32,
    #[serde(default)]
    allowed_models: Option<serde_json::Value>,
}

fn default_rate_limit() -> i32 {
    60
}

async fn create_key(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Json(request): Json<CreateKeyRequest>,
) -> Result<Response, GatewayError> {
    if request.name.is_empty() || request.name.len() > 255 {
        return Err(GatewayError::validation_field(
            "name must be between 1 and 255 characters",
            "name",
        ));
    }
    if !(1..=10_000).contains(&request.rate_limit) {
        return Err(GatewayError::validation_field(
            "rate_limit must be between 1 and 10000",
            "rate_limit",
        ));
    }

    let minted = auth::mint_key();
    let row = crate::db::keys::create(
        &state.db,
        crate::db::keys::CreateKey {
            org_id: user.org_id,
            key_hash: &minted.hash,
            key_prefix: &minted.prefix,
            name: &request.name,
            team_id: request.team_id.as_deref(),
            rate_limit: request.rate_limit,
            allowed_models: request.allowed_models.as_ref(),
        },
    )
    .await
    .map_err(|e| GatewayError::Internal(anyhow::anyhow!("key creation failed: {e}")))?;

    // The only response that ever carries the raw key.
    let mut body = serde_json::to_value(&row)
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("serializing key row: {e}")))?;
    body["key"] = json!(minted.plaintext);
    Ok((StatusCode::CREATED, Json(json!({ "success": true, "data": body }))).into_response())
}

async fn list_keys(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
) -> Result<Response, GatewayError> {
    let keys = crate::db::keys::list_for_org(&state.db, user.org_id)
        .await
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("key listing failed: {e}")))?;
    Ok(Json(json!({ "success": true, "data": keys })).into_response())
}

async fn revoke_key(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Path(key_id): Path<Uuid>,
) -> Result<Response, GatewayError> {
    let revoked = crate::db::keys::revoke(&state.db, user.org_id, key_id)
        .await
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("key revocation failed: {e}")))?;
    if !revoked {
        return Err(GatewayError::NotFound("gateway key not found".into()));
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}
