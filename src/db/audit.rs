//! Store for `audit_logs` — append-only, read back by the audit listing API.

use sqlx::PgPool;
use uuid::Uuid;

use super::models::AuditLog;

pub struct NewAuditLog<'a> {
    pub org_id: Uuid,
    pub user_id: Option<Uuid>,
    pub action: &'a str,
    pub resource_type: &'a str,
    pub resource_id: Option<&'a str>,
    pub details: serde_json::Value,
    pub ip_address: Option<&'a str>,
    pub user_name: Option<&'a str>,
}

pub async fn insert(db: &PgPool, entry: NewAuditLog<'_>) -> sqlx::Result<Uuid> {
    let id: Uuid = sqlx::query_scalar(
        "INSERT INTO audit_logs \
         (org_id, user_id, action, resource_type, resource_id, details_json, ip_address, user_name) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING id",
    )
    .bind(entry.org_id)
    .bind(entry.user_id)
    .bind(entry.action)
    .bind(entry.resource_type)
    .bind(entry.resource_id)
    .bind(entry.details)
    .bind(entry.ip_address)
    .bind(entry.user_name)
    .fetch_one(db)
    .await?;
    Ok(id)
}

pub async fn list_for_org(db: &PgPool, org_id: Uuid, limit: i64) -> sqlx::Result<Vec<AuditLog>> {
    sqlx::query_as::<_, AuditLog>(
        "SELECT * FROM audit_logs WHERE org_id = $1 ORDER BY created_at DESC LIMIT $2",
    )
    .bind(org_id)
    .bind(limit.clamp(1, 500))
    .fetch_all(db)
    .await
}
