//! Store for `organizations` and the subscription-change mirror.

use sqlx::PgPool;
use uuid::Uuid;

use super::models::Organization;

pub async fn find(db: &PgPool, org_id: Uuid) -> sqlx::Result<Option<Organization>> {
    sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE id = $1")
        .bind(org_id)
        .fetch_optional(db)
        .await
}

/// Change an org's tier and mirror the change into `subscription_history`.
/// Both writes share a transaction; tier state and its history cannot drift.
pub async fn change_tier(
    db: &PgPool,
    org_id: Uuid,
    new_tier: &str,
    changed_by: Option<Uuid>,
    reason: Option<&str>,
) -> sqlx::Result<()> {
    let mut tx = db.begin().await?;

    let previous: Option<String> =
        sqlx::query_scalar("SELECT subscription_tier FROM organizations WHERE id = $1 FOR UPDATE")
            .bind(org_id)
            .fetch_optional(&mut *tx)
            .await?;
    let Some(previous) = previous else {
        return Err(sqlx::Error::RowNotFound);
    };

    sqlx::query(
        "UPDATE organizations SET subscription_tier = $2, subscription_updated_at = now() \
         WHERE id = $1",
    )
    .bind(org_id)
    .bind(new_tier)
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        "INSERT INTO subscription_history (org_id, previous_tier, new_tier, changed_by_user_id, reason) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(org_id)
    .bind(previous)
    .bind(new_tier)
    .bind(changed_by)
    .bind(reason)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

pub async fn count_users(db: &PgPool, org_id: Uuid) -> sqlx::Result<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE org_id = $1")
        .bind(org_id)
        .fetch_one(db)
        .await
}

/// Active managed deployments for an org — compared against
/// `bonobot_agent_limit` at managed-inference admission.
pub async fn active_managed_deployments(db: &PgPool, org_id: Uuid) -> sqlx::Result<i64> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM deployments d \
         JOIN cloud_providers p ON p.id = d.provider_id \
         WHERE d.org_id = $1 AND d.status = 'active' AND p.is_managed",
    )
    .bind(org_id)
    .fetch_one(db)
    .await
}
