//! Upstream provider management (`/api/providers`).
//!
//! `connect` is the only way credentials enter the system: they are validated
//! against the upstream with a lightweight identity call, encrypted with the
//! credential vault, and stored as ciphertext. The provider's model catalog
//! is synced in the same call so routing has candidates immediately.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Extension, Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    db::models::CloudProvider,
    error::GatewayError,
    gateway::features::{self, Limit, Tier},
    providers::ProviderClient,
    state::AppState,
};

use super::session_auth::SessionUser;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/providers", get(list_providers))
        .route("/api/providers/connect", post(connect_provider))
        .route("/api/providers/{provider_id}", delete(disconnect_provider))
        .route("/api/providers/{provider_id}/health", get(provider_health))
        .route("/api/providers/{provider_id}/costs", get(provider_costs))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ConnectRequest {
    provider_type: String,
    #[serde(default)]
    credentials: serde_json::Value,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    is_managed: bool,
}

async fn connect_provider(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Json(request): Json<ConnectRequest>,
) -> Result<Response, GatewayError> {
    let org = features::load_org(&state.db, user.org_id).await?;

    // Tier quota on connected providers.
    if let Some(cap) = features::tier_limit(Tier::parse(&org.subscription_tier), Limit::Providers) {
        let current = crate::db::providers::count_active(&state.db, org.id)
            .await
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("provider count failed: {e}")))?;
        if current >= cap {
            return Err(GatewayError::UpgradeRequired(format!(
                "provider limit of {cap} reached for the current tier"
            )));
        }
    }

    let master_key = if request.is_managed {
        Some(
            state
                .secrets
                .master_key(&request.provider_type)
                .ok_or_else(|| {
                    GatewayError::validation_field(
                        format!(
                            "managed mode is not available for `{}`",
                            request.provider_type
                        ),
                        "is_managed",
                    )
                })?,
        )
    } else {
        None
    };

    // Region rides inside credentials for client construction.
    let mut credentials = request.credentials.clone();
    if let (Some(region), Some(obj)) = (&request.region, credentials.as_object_mut()) {
        obj.entry("region").or_insert(json!(region));
    }

    // Prove the credentials before persisting anything.
    let client = ProviderClient::from_credentials(&request.provider_type, &credentials, master_key)
        .map_err(|e| GatewayError::validation_field(e.to_string(), "credentials"))?;
    let info = client
        .validate_credentials()
        .await
        .map_err(|e| GatewayError::UpstreamFailed(e.to_string()))?;
    if !info.valid {
        return Err(GatewayError::validation_field(
            format!("credential validation failed: {}", info.message),
            "credentials",
        ));
    }

    let ciphertext =
        crate::crypto::encrypt_credentials(&credentials, &state.settings.encryption_key)
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("credential encryption: {e}")))?;

    let provider = crate::db::providers::create(
        &state.db,
        crate::db::providers::CreateProvider {
            org_id: org.id,
            provider_type: &request.provider_type,
            credentials_ciphertext: &ciphertext,
            region: request.region.as_deref(),
            is_managed: request.is_managed,
        },
    )
    .await
    .map_err(|e| GatewayError::Internal(anyhow::anyhow!("provider creation failed: {e}")))?;

    // Catalog sync; a listing failure leaves the provider connected with an
    // empty catalog rather than rolling back the connect.
    let model_count = match client.list_models().await {
        Ok(listings) => {
            if let Err(e) =
                crate::db::providers::replace_catalog(&state.db, provider.id, &listings).await
            {
                tracing::warn!(provider_id = %provider.id, error = %e, "catalog sync failed");
            }
            listings.len()
        }
        Err(e) => {
            tracing::warn!(provider_id = %provider.id, error = %e, "model listing failed");
            0
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "data": { "provider": public_view(&provider), "models_synced": model_count },
        })),
    )
        .into_response())
}

async fn list_providers(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
) -> Result<Response, GatewayError> {
    let providers = crate::db::providers::list_active(&state.db, user.org_id)
        .await
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("provider listing failed: {e}")))?;
    let data: Vec<_> = providers.iter().map(public_view).collect();
    Ok(Json(json!({ "success": true, "data": data })).into_response())
}

async fn disconnect_provider(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Path(provider_id): Path<Uuid>,
) -> Result<Response, GatewayError> {
    let deleted = crate::db::providers::delete(&state.db, user.org_id, provider_id)
        .await
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("provider deletion failed: {e}")))?;
    if !deleted {
        return Err(GatewayError::NotFound("provider not found".into()));
    }
    // The cached client holds the old credentials; drop it.
    state.clients.invalidate(provider_id);
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn provider_health(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Path(provider_id): Path<Uuid>,
) -> Result<Response, GatewayError> {
    let provider = load_provider(&state, user.org_id, provider_id).await?;
    let client = state.provider_client(&provider)?;
    let health = client.health_check().await;
    Ok(Json(json!({ "success": true, "data": health })).into_response())
}

#[derive(Debug, Deserialize)]
struct CostQuery {
    from: NaiveDate,
    to: NaiveDate,
}

async fn provider_costs(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<SessionUser>,
    Path(provider_id): Path<Uuid>,
    Query(query): Query<CostQuery>,
) -> Result<Response, GatewayError> {
    if query.from > query.to {
        return Err(GatewayError::validation_field(
            "`from` must not be after `to`",
            "from",
        ));
    }
    let provider = load_provider(&state, user.org_id, provider_id).await?;
    let client = state.provider_client(&provider)?;
    let costs = client
        .get_costs(query.from, query.to)
        .await
        .map_err(|e| GatewayError::UpstreamFailed(e.to_string()))?;
    Ok(Json(json!({ "success": true, "data": costs })).into_response())
}

async fn load_provider(
    state: &AppState,
    org_id: Uuid,
    provider_id: Uuid,
) -> Result<CloudProvider, GatewayError> {
    crate::db::providers::find(&state.db, org_id, provider_id)
        .await
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("provider lookup failed: {e}")))?
        .ok_or_else(|| GatewayError::NotFound("provider not found".into()))
}

/// Row view with the ciphertext withheld.
fn public_view(provider: &CloudProvider) -> serde_json::Value {
    json!({
        "id": provider.id,
        "provider_type": provider.provider_type,
        "status": provider.status,
        "region": provider.region,
        "is_managed": provider.is_managed,
        "managed_usage_tokens": provider.managed_usage_tokens,
        "managed_usage_cost": provider.managed_usage_cost,
        "created_at": provider.created_at,
    })
}
