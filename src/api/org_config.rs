//! Org-wide gateway configuration (`/api/gateway/config`).

use std::sync::Arc;

use axum::{
    extract::State,
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{error::GatewayError, gateway::routing::Strategy, state::AppState};

use super::session_auth::SessionUser;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/gateway/config", get(get_config).put(put_config))
        .with_state(state)
}

async fn get_config(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
) -> Result<Response, GatewayError> {
    let config = crate::db::org_config::find(&state.db, user.org_id)
        .await
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("config lookup failed: {e}")))?;

    let data = match config {
        Some(config) => serde_json::to_value(&config)
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("serializing config: {e}")))?,
        // Defaults mirrored to the caller before any row exists.
        None => json!({
            "enabled_providers": {},
            "routing_strategy": "cost_optimized",
            "fallback_models": {},
            "default_rate_limit": 60,
            "cost_tracking_enabled": true,
            "custom_routing_rules": {},
        }),
    };
    Ok(Json(json!({ "success": true, "data": data })).into_response())
}

#[derive(Debug, Deserialize)]
struct ConfigBody {
    #[serde(default)]
    enabled_providers: serde_json::Map<String, Value>,
    routing_strategy: String,
    #[serde(default)]
    fallback_models: serde_json::Map<String, Value>,
    #[serde(default = "default_rate_limit")]
    default_rate_limit: i32,
    #[serde(default = "default_true")]
    cost_tracking_enabled: bool,
    #[serde(default)]
    custom_routing_rules: serde_json::Map<String, Value>,
}

fn default_rate_limit() -> i32 {
    60
}
fn default_true() -> bool {
    true
}

async fn put_config(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Json(body): Json<ConfigBody>,
) -> Result<Response, GatewayError> {
    let strategy = Strategy::parse(&body.routing_strategy).ok_or_else(|| {
        GatewayError::validation_field(
            format!("unknown routing strategy `{}`", body.routing_strategy),
            "routing_strategy",
        )
    })?;
    for (model, chain) in &body.fallback_models {
        let valid = chain
            .as_array()
            .is_some_and(|a| a.iter().all(Value::is_string));
        if !valid {
            return Err(GatewayError::validation_field(
                format!("fallback chain for `{model}` must be an array of model ids"),
                "fallback_models",
            ));
        }
    }
    if !(1..=10_000).contains(&body.default_rate_limit) {
        return Err(GatewayError::validation_field(
            "default_rate_limit must be between 1 and 10000",
            "default_rate_limit",
        ));
    }

    let enabled_providers = Value::Object(body.enabled_providers);
    let fallback_models = Value::Object(body.fallback_models);
    let custom_routing_rules = Value::Object(body.custom_routing_rules);
    let updated = crate::db::org_config::upsert(
        &state.db,
        user.org_id,
        crate::db::org_config::ConfigUpdate {
            enabled_providers: &enabled_providers,
            routing_strategy: strategy.as_str(),
            fallback_models: &fallback_models,
            default_rate_limit: body.default_rate_limit,
            cost_tracking_enabled: body.cost_tracking_enabled,
            custom_routing_rules: &custom_routing_rules,
        },
    )
    .await
    .map_err(|e| GatewayError::Internal(anyhow::anyhow!("config upsert failed: {e}")))?;

    Ok(Json(json!({ "success": true, "data": updated })).into_response())
}
