//! Routing policy CRUD (`/api/routing/policies`).
//!
//! Routing policies are a premium feature; every route here gates on the
//! org's tier before touching the table. Validation is strict: strategy
//! constraints (failover ≥ 2 models, A/B weights summing to 100) and the
//! closed rules schema are enforced at write time so the hot path can trust
//! stored documents.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    db::models::{Organization, PolicyModel},
    error::GatewayError,
    gateway::{
        features::{self, Feature},
        routing::{validate_policy_models, Rules, Strategy},
    },
    state::AppState,
};

use super::session_auth::SessionUser;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/routing/policies", get(list_policies).post(create_policy))
        .route(
            "/api/routing/policies/{policy_id}",
            get(get_policy).patch(update_policy).delete(delete_policy),
        )
        .with_state(state)
}

async fn require_routing(state: &AppState, user: &SessionUser) -> Result<Organization, GatewayError> {
    let org = features::load_org(&state.db, user.org_id).await?;
    features::require_feature(&org, Feature::Routing)?;
    Ok(org)
}

#[derive(Debug, Deserialize)]
struct CreatePolicyRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
    strategy: String,
    models: Vec<PolicyModel>,
    #[serde(default)]
    rules: serde_json::Value,
    #[serde(default = "default_true")]
    is_active: bool,
    api_key_prefix: String,
}

fn default_true() -> bool {
    true
}

fn validate_name(name: &str) -> Result<(), GatewayError> {
    if name.is_empty() || name.len() > 255 {
        return Err(GatewayError::validation_field(
            "name must be between 1 and 255 characters",
            "name",
        ));
    }
    Ok(())
}

async fn create_policy(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Json(request): Json<CreatePolicyRequest>,
) -> Result<Response, GatewayError> {
    require_routing(&state, &user).await?;
    validate_name(&request.name)?;
    let strategy = Strategy::parse(&request.strategy).ok_or_else(|| {
        GatewayError::validation_field(
            format!("unknown strategy `{}`", request.strategy),
            "strategy",
        )
    })?;
    validate_policy_models(strategy, &request.models)?;
    Rules::parse_closed(&request.rules)?;

    let models = serde_json::to_value(&request.models)
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("serializing models: {e}")))?;
    let rules = if request.rules.is_null() {
        json!({})
    } else {
        request.rules
    };

    let policy = crate::db::policies::create(
        &state.db,
        crate::db::policies::CreatePolicy {
            org_id: user.org_id,
            name: &request.name,
            description: request.description.as_deref(),
            strategy: strategy.as_str(),
            models: &models,
            rules: &rules,
            is_active: request.is_active,
            api_key_prefix: &request.api_key_prefix,
        },
    )
    .await
    .map_err(|e| match &e {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            GatewayError::validation_field(
                "a policy is already bound to this key prefix",
                "api_key_prefix",
            )
        }
        _ => GatewayError::Internal(anyhow::anyhow!("policy creation failed: {e}")),
    })?;

    Ok((StatusCode::CREATED, Json(json!({ "success": true, "data": policy }))).into_response())
}

async fn list_policies(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
) -> Result<Response, GatewayError> {
    require_routing(&state, &user).await?;
    let policies = crate::db::policies::list_for_org(&state.db, user.org_id)
        .await
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("policy listing failed: {e}")))?;
    Ok(Json(json!({ "success": true, "data": policies })).into_response())
}

async fn get_policy(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Path(policy_id): Path<Uuid>,
) -> Result<Response, GatewayError> {
    require_routing(&state, &user).await?;
    let policy = crate::db::policies::find(&state.db, user.org_id, policy_id)
        .await
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("policy lookup failed: {e}")))?
        .ok_or_else(|| GatewayError::NotFound("routing policy not found".into()))?;
    Ok(Json(json!({ "success": true, "data": policy })).into_response())
}

#[derive(Debug, Deserialize)]
struct UpdatePolicyRequest {
    name: Option<String>,
    description: Option<String>,
    strategy: Option<String>,
    models: Option<Vec<PolicyModel>>,
    rules: Option<serde_json::Value>,
    is_active: Option<bool>,
}

async fn update_policy(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Path(policy_id): Path<Uuid>,
    Json(request): Json<UpdatePolicyRequest>,
) -> Result<Response, GatewayError> {
    require_routing(&state, &user).await?;

    let existing = crate::db::policies::find(&state.db, user.org_id, policy_id)
        .await
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("policy lookup failed: {e}")))?
        .ok_or_else(|| GatewayError::NotFound("routing policy not found".into()))?;

    if let Some(name) = &request.name {
        validate_name(name)?;
    }
    // Validate the merged document, not just the delta.
    let strategy_raw = request.strategy.as_deref().unwrap_or(&existing.strategy);
    let strategy = Strategy::parse(strategy_raw).ok_or_else(|| {
        GatewayError::validation_field(format!("unknown strategy `{strategy_raw}`"), "strategy")
    })?;
    let merged_models = match &request.models {
        Some(models) => models.clone(),
        None => existing.model_entries(),
    };
    validate_policy_models(strategy, &merged_models)?;
    if let Some(rules) = &request.rules {
        Rules::parse_closed(rules)?;
    }

    let models_value = request
        .models
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("serializing models: {e}")))?;

    let updated = crate::db::policies::update(
        &state.db,
        user.org_id,
        policy_id,
        crate::db::policies::UpdatePolicy {
            name: request.name.as_deref(),
            description: request.description.as_deref(),
            strategy: request.strategy.as_deref().map(|_| strategy.as_str()),
            models: models_value.as_ref(),
            rules: request.rules.as_ref(),
            is_active: request.is_active,
        },
    )
    .await
    .map_err(|e| GatewayError::Internal(anyhow::anyhow!("policy update failed: {e}")))?
    .ok_or_else(|| GatewayError::NotFound("routing policy not found".into()))?;

    Ok(Json(json!({ "success": true, "data": updated })).into_response())
}

async fn delete_policy(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Path(policy_id): Path<Uuid>,
) -> Result<Response, GatewayError> {
    require_routing(&state, &user).await?;
    let deleted = crate::db::policies::delete(&state.db, user.org_id, policy_id)
        .await
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("policy deletion failed: {e}")))?;
    if !deleted {
        return Err(GatewayError::NotFound("routing policy not found".into()));
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}
