//! Store for `routing_policies`.

use sqlx::PgPool;
use uuid::Uuid;

use super::models::RoutingPolicy;

/// Resolve the active policy bound to a gateway key prefix, if any.
/// This is the first step of the routing engine's policy lookup order.
pub async fn find_by_key_prefix(
    db: &PgPool,
    org_id: Uuid,
    key_prefix: &str,
) -> sqlx::Result<Option<RoutingPolicy>> {
    sqlx::query_as::<_, RoutingPolicy>(
        "SELECT * FROM routing_policies \
         WHERE org_id = $1 AND api_key_prefix = $2 AND is_active",
    )
    .bind(org_id)
    .bind(key_prefix)
    .fetch_optional(db)
    .await
}

pub async fn find(db: &PgPool, org_id: Uuid, policy_id: Uuid) -> sqlx::Result<Option<RoutingPolicy>> {
    sqlx::query_as::<_, RoutingPolicy>(
        "SELECT * FROM routing_policies WHERE id = $1 AND org_id = $2",
    )
    .bind(policy_id)
    .bind(org_id)
    .fetch_optional(db)
    .await
}

pub async fn list_for_org(db: &PgPool, org_id: Uuid) -> sqlx::Result<Vec<RoutingPolicy>> {
    sqlx::query_as::<_, RoutingPolicy>(
        "SELECT * FROM routing_policies WHERE org_id = $1 ORDER BY created_at DESC",
    )
    .bind(org_id)
    .fetch_all(db)
    .await
}

pub struct CreatePolicy<'a> {
    pub org_id: Uuid,
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub strategy: &'a str,
    pub models: &'a serde_json::Value,
    pub rules: &'a serde_json::Value,
    pub is_active: bool,
    pub api_key_prefix: &'a str,
}

pub async fn create(db: &PgPool, params: CreatePolicy<'_>) -> sqlx::Result<RoutingPolicy> {
    sqlx::query_as::<_, RoutingPolicy>(
        "INSERT INTO routing_policies \
         (org_id, name, description, strategy, models, rules, is_active, api_key_prefix) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *",
    )
    .bind(params.org_id)
    .bind(params.name)
    .bind(params.description)
    .bind(params.strategy)
    .bind(params.models)
    .bind(params.rules)
    .bind(params.is_active)
    .bind(params.api_key_prefix)
    .fetch_one(db)
    .await
}

pub struct UpdatePolicy<'a> {
    pub name: Option<&'a str>,
    pub description: Option<&'a str>,
    pub strategy: Option<&'a str>,
    pub models: Option<&'a serde_json::Value>,
    pub rules: Option<&'a serde_json::Value>,
    pub is_active: Option<bool>,
}

pub async fn update(
    db: &PgPool,
    org_id: Uuid,
    policy_id: Uuid,
    update: UpdatePolicy<'_>,
) -> sqlx::Result<Option<RoutingPolicy>> {
    sqlx::query_as::<_, RoutingPolicy>(
        "UPDATE routing_policies SET \
           name = COALESCE($3, name), \
           description = COALESCE($4, description), \
           strategy = COALESCE($5, strategy), \
           models = COALESCE($6, models), \
           rules = COALESCE($7, rules), \
           is_active = COALESCE($8, is_active), \
           updated_at = now() \
         WHERE id = $1 AND org_id = $2 RETURNING *",
    )
    .bind(policy_id)
    .bind(org_id)
    .bind(update.name)
    .bind(update.description)
    .bind(update.strategy)
    .bind(update.models)
    .bind(update.rules)
    .bind(update.is_active)
    .fetch_optional(db)
    .await
}

pub async fn delete(db: &PgPool, org_id: Uuid, policy_id: Uuid) -> sqlx::Result<bool> {
    let result = sqlx::query("DELETE FROM routing_policies WHERE id = $1 AND org_id = $2")
        .bind(policy_id)
        .bind(org_id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() == 1)
}
