//! Store for `gateway_configs` — one row per org.

use sqlx::PgPool;
use uuid::Uuid;

use super::models::GatewayConfig;

pub async fn find(db: &PgPool, org_id: Uuid) -> sqlx::Result<Option<GatewayConfig>> {
    sqlx::query_as::<_, GatewayConfig>("SELECT * FROM gateway_configs WHERE org_id = $1")
        .bind(org_id)
        .fetch_optional(db)
        .await
}

pub struct ConfigUpdate<'a> {
    pub enabled_providers: &'a serde_json::Value,
    pub routing_strategy: &'a str,
    pub fallback_models: &'a serde_json::Value,
    pub default_rate_limit: i32,
    pub cost_tracking_enabled: bool,
    pub custom_routing_rules: &'a serde_json::Value,
}

/// Insert-or-replace the org's gateway configuration.
pub async fn upsert(
    db: &PgPool,
    org_id: Uuid,
    update: ConfigUpdate<'_>,
) -> sqlx::Result<GatewayConfig> {
    sqlx::query_as::<_, GatewayConfig>(
        "INSERT INTO gateway_configs \
         (org_id, enabled_providers, routing_strategy, fallback_models, \
          default_rate_limit, cost_tracking_enabled, custom_routing_rules) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (org_id) DO UPDATE SET \
           enabled_providers = EXCLUDED.enabled_providers, \
           routing_strategy = EXCLUDED.routing_strategy, \
           fallback_models = EXCLUDED.fallback_models, \
           default_rate_limit = EXCLUDED.default_rate_limit, \
           cost_tracking_enabled = EXCLUDED.cost_tracking_enabled, \
           custom_routing_rules = EXCLUDED.custom_routing_rules, \
           updated_at = now() \
         RETURNING *",
    )
    .bind(org_id)
    .bind(update.enabled_providers)
    .bind(update.routing_strategy)
    .bind(update.fallback_models)
    .bind(update.default_rate_limit)
    .bind(update.cost_tracking_enabled)
    .bind(update.custom_routing_rules)
    .fetch_one(db)
    .await
}
