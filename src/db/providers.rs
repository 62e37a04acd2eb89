//! Store for `cloud_providers` and their model catalog rows.

use sqlx::PgPool;
use uuid::Uuid;

use super::models::{CloudProvider, ModelRow};

pub async fn find(db: &PgPool, org_id: Uuid, provider_id: Uuid) -> sqlx::Result<Option<CloudProvider>> {
    sqlx::query_as::<_, CloudProvider>(
        "SELECT * FROM cloud_providers WHERE id = $1 AND org_id = $2",
    )
    .bind(provider_id)
    .bind(org_id)
    .fetch_optional(db)
    .await
}

pub async fn list_active(db: &PgPool, org_id: Uuid) -> sqlx::Result<Vec<CloudProvider>> {
    sqlx::query_as::<_, CloudProvider>(
        "SELECT * FROM cloud_providers WHERE org_id = $1 AND status = 'active' ORDER BY created_at",
    )
    .bind(org_id)
    .fetch_all(db)
    .await
}

/// Catalog rows for all active providers of an org, for routing candidate
/// discovery. One round trip; the routing engine joins in memory.
pub async fn catalog_for_org(db: &PgPool, org_id: Uuid) -> sqlx::Result<Vec<ModelRow>> {
    sqlx::query_as::<_, ModelRow>(
        "SELECT m.id, m.provider_id, m.model_id, m.display_name, m.capabilities, m.pricing_info \
         FROM models m \
         JOIN cloud_providers p ON p.id = m.provider_id \
         WHERE p.org_id = $1 AND p.status = 'active'",
    )
    .bind(org_id)
    .fetch_all(db)
    .await
}

pub async fn count_active(db: &PgPool, org_id: Uuid) -> sqlx::Result<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM cloud_providers WHERE org_id = $1 AND status = 'active'")
        .bind(org_id)
        .fetch_one(db)
        .await
}

pub struct CreateProvider<'a> {
    pub org_id: Uuid,
    pub provider_type: &'a str,
    pub credentials_ciphertext: &'a str,
    pub region: Option<&'a str>,
    pub is_managed: bool,
}

pub async fn create(db: &PgPool, params: CreateProvider<'_>) -> sqlx::Result<CloudProvider> {
    sqlx::query_as::<_, CloudProvider>(
        "INSERT INTO cloud_providers (org_id, provider_type, credentials_ciphertext, region, is_managed, status) \
         VALUES ($1, $2, $3, $4, $5, 'active') RETURNING *",
    )
    .bind(params.org_id)
    .bind(params.provider_type)
    .bind(params.credentials_ciphertext)
    .bind(params.region)
    .bind(params.is_managed)
    .fetch_one(db)
    .await
}

pub async fn delete(db: &PgPool, org_id: Uuid, provider_id: Uuid) -> sqlx::Result<bool> {
    let result = sqlx::query("DELETE FROM cloud_providers WHERE id = $1 AND org_id = $2")
        .bind(provider_id)
        .bind(org_id)
        .execute(db)
        .await?;
    Ok(result.rows_affected() == 1)
}

/// Replace a provider's model catalog with a freshly synced listing.
pub async fn replace_catalog(
    db: &PgPool,
    provider_id: Uuid,
    listings: &[crate::providers::ModelListing],
) -> sqlx::Result<()> {
    let mut tx = db.begin().await?;
    sqlx::query("DELETE FROM models WHERE provider_id = $1")
        .bind(provider_id)
        .execute(&mut *tx)
        .await?;
    for listing in listings {
        let pricing = serde_json::json!({
            "input_per_1m": listing.input_price_per_1m,
            "output_per_1m": listing.output_price_per_1m,
            "context_window": listing.context_window,
            "streaming_supported": listing.streaming_supported,
        });
        sqlx::query(
            "INSERT INTO models (provider_id, model_id, display_name, capabilities, pricing_info) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (provider_id, model_id) DO UPDATE SET \
               display_name = EXCLUDED.display_name, \
               capabilities = EXCLUDED.capabilities, \
               pricing_info = EXCLUDED.pricing_info",
        )
        .bind(provider_id)
        .bind(&listing.model_id)
        .bind(&listing.display_name)
        .bind(serde_json::json!(listing.capabilities))
        .bind(pricing)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await
}

/// Accumulate managed-inference usage on the provider row.
pub async fn add_managed_usage(
    db: &PgPool,
    provider_id: Uuid,
    tokens: i64,
    cost: f64,
) -> sqlx::Result<()> {
    sqlx::query(
        "UPDATE cloud_providers \
         SET managed_usage_tokens = managed_usage_tokens + $2, \
             managed_usage_cost = managed_usage_cost + $3 \
         WHERE id = $1",
    )
    .bind(provider_id)
    .bind(tokens)
    .bind(cost)
    .execute(db)
    .await?;
    Ok(())
}
