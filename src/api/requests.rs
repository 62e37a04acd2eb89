//! Request logs and usage rollups (`/api/gateway/requests`, `/api/gateway/usage`).

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{error::GatewayError, state::AppState};

use super::session_auth::SessionUser;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/gateway/requests", get(list_requests))
        .route("/api/gateway/usage", get(usage))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    key_id: Option<Uuid>,
    model: Option<String>,
    status: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    100
}

async fn list_requests(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Query(query): Query<LogQuery>,
) -> Result<Response, GatewayError> {
    if let Some(status) = &query.status {
        if !matches!(status.as_str(), "success" | "error" | "rate_limited") {
            return Err(GatewayError::validation_field(
                "status must be one of success, error, rate_limited",
                "status",
            ));
        }
    }

    let filter = crate::db::requests::LogFilter {
        from: query.from,
        to: query.to,
        key_id: query.key_id,
        model: query.model.clone(),
        status: query.status.clone(),
        limit: query.limit,
        offset: query.offset,
    };
    let rows = crate::db::requests::list(&state.db, user.org_id, &filter)
        .await
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("request log query failed: {e}")))?;

    Ok(Json(json!({
        "success": true,
        "data": rows,
        "pagination": { "limit": filter.limit.clamp(1, 500), "offset": filter.offset.max(0) },
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

async fn usage(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Query(query): Query<UsageQuery>,
) -> Result<Response, GatewayError> {
    let summary = crate::db::requests::usage_summary(&state.db, user.org_id, query.from, query.to)
        .await
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("usage rollup failed: {e}")))?;
    Ok(Json(json!({ "success": true, "data": summary })).into_response())
}
