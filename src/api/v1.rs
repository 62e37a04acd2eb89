//! The OpenAI-compatible gateway surface (`/v1/*`).
//!
//! Handlers are intentionally thin: the endpoint only selects the request
//! kind; everything else — gating, rate limiting, routing, invocation,
//! recording — lives in [`crate::gateway::pipeline`].

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};

use crate::{
    error::GatewayError,
    gateway::{auth::AuthenticatedKey, pipeline},
    providers::RequestKind,
    state::AppState,
};

use super::admission::RequestId;

/// Build the `/v1/*` router. Key auth is layered on by the caller.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/models", get(list_models))
        .with_state(state)
}

/// Map a JSON-decode failure into the uniform envelope instead of axum's
/// plain-text rejection.
fn decode(body: Result<Json<Value>, JsonRejection>, request_id: &str) -> Result<Value, Response> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(GatewayError::validation(format!(
            "request body is not valid JSON: {rejection}"
        ))
        .into_envelope(Some(request_id), true)),
    }
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(AuthenticatedKey(key)): Extension<AuthenticatedKey>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let body = match decode(body, &request_id) {
        Ok(body) => body,
        Err(rejected) => return rejected,
    };
    pipeline::execute(state, key, RequestKind::Chat, body, request_id).await
}

async fn completions(
    State(state): State<Arc<AppState>>,
    Extension(AuthenticatedKey(key)): Extension<AuthenticatedKey>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let body = match decode(body, &request_id) {
        Ok(body) => body,
        Err(rejected) => return rejected,
    };
    pipeline::execute(state, key, RequestKind::Completion, body, request_id).await
}

async fn embeddings(
    State(state): State<Arc<AppState>>,
    Extension(AuthenticatedKey(key)): Extension<AuthenticatedKey>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let body = match decode(body, &request_id) {
        Ok(body) => body,
        Err(rejected) => return rejected,
    };
    pipeline::execute(state, key, RequestKind::Embedding, body, request_id).await
}

/// `GET /v1/models` — the org's connected catalog in OpenAI list shape.
async fn list_models(
    State(state): State<Arc<AppState>>,
    Extension(AuthenticatedKey(key)): Extension<AuthenticatedKey>,
    Extension(RequestId(request_id)): Extension<RequestId>,
) -> Response {
    let providers = match crate::db::providers::list_active(&state.db, key.org_id).await {
        Ok(p) => p,
        Err(e) => {
            return GatewayError::ServiceUnavailable(format!("provider lookup failed: {e}"))
                .into_envelope(Some(&request_id), true)
        }
    };
    let rows = match crate::db::providers::catalog_for_org(&state.db, key.org_id).await {
        Ok(rows) => rows,
        Err(e) => {
            return GatewayError::ServiceUnavailable(format!("catalog lookup failed: {e}"))
                .into_envelope(Some(&request_id), true)
        }
    };

    let owner_of: std::collections::HashMap<uuid::Uuid, &str> = providers
        .iter()
        .map(|p| (p.id, p.provider_type.as_str()))
        .collect();
    let data: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "id": row.model_id,
                "object": "model",
                "created": 0,
                "owned_by": owner_of.get(&row.provider_id).copied().unwrap_or("unknown"),
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": data })).into_response()
}
