//! Admin-only management routes: subscription tier changes (mirrored to
//! `subscription_history`), monthly usage counter reset, and the audit trail
//! read path.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    error::GatewayError,
    gateway::features::{self, Feature, Limit, Tier},
    state::AppState,
};

use super::session_auth::SessionUser;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/admin/organizations/{org_id}/tier", put(change_tier))
        .route("/api/admin/usage/reset", post(reset_usage))
        .route("/api/admin/entitlements", get(entitlements))
        .route("/api/audit/logs", get(list_audit_logs))
        .with_state(state)
}

fn require_admin(user: &SessionUser) -> Result<(), GatewayError> {
    if user.role != "admin" {
        return Err(GatewayError::Forbidden(
            "admin role required for this operation".into(),
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct TierChange {
    tier: String,
    #[serde(default)]
    reason: Option<String>,
}

const KNOWN_TIERS: &[&str] = &["free", "starter", "pro", "enterprise"];

async fn change_tier(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Path(org_id): Path<Uuid>,
    Json(change): Json<TierChange>,
) -> Result<Response, GatewayError> {
    require_admin(&user)?;
    // Admins act only within their own organization.
    if org_id != user.org_id {
        return Err(GatewayError::Forbidden(
            "cannot change another organization's tier".into(),
        ));
    }
    if !KNOWN_TIERS.contains(&change.tier.as_str()) {
        return Err(GatewayError::validation_field(
            format!("unknown tier `{}`", change.tier),
            "tier",
        ));
    }

    crate::db::orgs::change_tier(
        &state.db,
        org_id,
        &change.tier,
        Some(user.user_id),
        change.reason.as_deref(),
    )
    .await
    .map_err(|e| match e {
        sqlx::Error::RowNotFound => GatewayError::NotFound("organization not found".into()),
        other => GatewayError::Internal(anyhow::anyhow!("tier change failed: {other}")),
    })?;

    Ok(Json(json!({ "success": true, "data": { "tier": change.tier } })).into_response())
}

async fn reset_usage(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
) -> Result<Response, GatewayError> {
    require_admin(&user)?;
    features::reset_gateway_counter(&state.cache, user.org_id).await?;
    Ok(Json(json!({ "success": true, "data": { "reset": true } })).into_response())
}

/// Current tier, feature availability, and usage against every quota — the
/// dashboard's one-call entitlement view.
async fn entitlements(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
) -> Result<Response, GatewayError> {
    let org = features::load_org(&state.db, user.org_id).await?;
    let tier = Tier::parse(&org.subscription_tier);

    let feature_map: serde_json::Map<String, serde_json::Value> = [
        Feature::Gateway,
        Feature::Routing,
        Feature::BudgetAlerts,
        Feature::Compliance,
        Feature::IacTemplates,
        Feature::Sso,
        Feature::KnowledgeBase,
    ]
    .into_iter()
    .map(|f| (f.name().to_string(), json!(features::tier_allows(tier, f))))
    .collect();

    let providers_used = crate::db::providers::count_active(&state.db, org.id)
        .await
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("provider count failed: {e}")))?;
    let members_used = crate::db::orgs::count_users(&state.db, org.id)
        .await
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("member count failed: {e}")))?;

    let limit_view = |used: i64, cap: Option<i64>| {
        json!({
            "used": used,
            "limit": cap,
            "at_limit": cap.is_some_and(|cap| used >= cap),
        })
    };

    Ok(Json(json!({
        "success": true,
        "data": {
            "organization": {
                "id": org.id,
                "name": org.name,
                "tier": org.subscription_tier,
                "status": org.subscription_status,
                "since": org.created_at,
                "updated_at": org.subscription_updated_at,
                "bonobot_plan": org.bonobot_plan,
                "bonobot_agent_limit": org.bonobot_agent_limit,
            },
            "features": feature_map,
            "limits": {
                "providers": limit_view(providers_used, features::tier_limit(tier, Limit::Providers)),
                "members": limit_view(members_used, features::tier_limit(tier, Limit::Members)),
                "gateway_calls_per_month": {
                    "limit": features::tier_limit(tier, Limit::GatewayCallsPerMonth),
                },
            },
        },
    }))
    .into_response())
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    100
}

async fn list_audit_logs(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Query(query): Query<AuditQuery>,
) -> Result<Response, GatewayError> {
    let logs = crate::db::audit::list_for_org(&state.db, user.org_id, query.limit)
        .await
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("audit query failed: {e}")))?;
    Ok(Json(json!({ "success": true, "data": logs })).into_response())
}
