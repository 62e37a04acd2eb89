//! Store for `gateway_keys`.

use sqlx::PgPool;
use uuid::Uuid;

use super::models::GatewayKey;

/// Look up a key by the SHA-256 hash of the raw bearer token.
///
/// Revoked keys are returned (with `revoked_at` set) so the authenticator
/// can distinguish "unknown" from "revoked" in its audit trail.
pub async fn find_by_hash(db: &PgPool, key_hash: &str) -> sqlx::Result<Option<GatewayKey>> {
    sqlx::query_as::<_, GatewayKey>("SELECT * FROM gateway_keys WHERE key_hash = $1")
        .bind(key_hash)
        .fetch_optional(db)
        .await
}

pub struct CreateKey<'a> {
    pub org_id: Uuid,
    pub key_hash: &'a str,
    pub key_prefix: &'a str,
    pub name: &'a str,
    pub team_id: Option<&'a str>,
    pub rate_limit: i32,
    pub allowed_models: Option<&'a serde_json::Value>,
}

pub async fn create(db: &PgPool, params: CreateKey<'_>) -> sqlx::Result<GatewayKey> {
    sqlx::query_as::<_, GatewayKey>(
        "INSERT INTO gateway_keys (org_id, key_hash, key_prefix, name, team_id, rate_limit, allowed_models) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING *",
    )
    .bind(params.org_id)
    .bind(params.key_hash)
    .bind(params.key_prefix)
    .bind(params.name)
    .bind(params.team_id)
    .bind(params.rate_limit)
    .bind(params.allowed_models)
    .fetch_one(db)
    .await
}

pub async fn list_for_org(db: &PgPool, org_id: Uuid) -> sqlx::Result<Vec<GatewayKey>> {
    sqlx::query_as::<_, GatewayKey>(
        "SELECT * FROM gateway_keys WHERE org_id = $1 ORDER BY created_at DESC",
    )
    .bind(org_id)
    .fetch_all(db)
    .await
}

/// Revoke a key. Returns `false` when the key does not exist in this org or
/// was already revoked.
pub async fn revoke(db: &PgPool, org_id: Uuid, key_id: Uuid) -> sqlx::Result<bool> {
    let result = sqlx::query(
        "UPDATE gateway_keys SET revoked_at = now() \
         WHERE id = $1 AND org_id = $2 AND revoked_at IS NULL",
    )
    .bind(key_id)
    .bind(org_id)
    .execute(db)
    .await?;
    Ok(result.rows_affected() == 1)
}
