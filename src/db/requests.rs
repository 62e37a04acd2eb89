//! Store for `gateway_requests` — the append-only billing/analytics trail.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::models::{GatewayRequest, NewGatewayRequest};

pub async fn insert(db: &PgPool, row: &NewGatewayRequest) -> sqlx::Result<Uuid> {
    let rec = sqlx::query(
        "INSERT INTO gateway_requests \
         (org_id, user_id, team_id, key_id, model_requested, model_used, provider, \
          input_tokens, output_tokens, cost, marked_up_cost, latency_ms, status, \
          error_message, is_managed) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
         RETURNING id",
    )
    .bind(row.org_id)
    .bind(row.user_id)
    .bind(&row.team_id)
    .bind(row.key_id)
    .bind(&row.model_requested)
    .bind(&row.model_used)
    .bind(&row.provider)
    .bind(row.input_tokens)
    .bind(row.output_tokens)
    .bind(row.cost)
    .bind(row.marked_up_cost)
    .bind(row.latency_ms)
    .bind(row.status.as_str())
    .bind(&row.error_message)
    .bind(row.is_managed)
    .fetch_one(db)
    .await?;
    rec.try_get("id")
}

/// Filters for the request-log listing endpoint. All optional; everything is
/// additionally scoped by `org_id`.
#[derive(Debug, Default)]
pub struct LogFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub key_id: Option<Uuid>,
    pub model: Option<String>,
    pub status: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

pub async fn list(
    db: &PgPool,
    org_id: Uuid,
    filter: &LogFilter,
) -> sqlx::Result<Vec<GatewayRequest>> {
    let limit = filter.limit.clamp(1, 500);
    sqlx::query_as::<_, GatewayRequest>(
        "SELECT id, org_id, key_id, model_requested, model_used, provider, \
                input_tokens, output_tokens, cost, marked_up_cost, latency_ms, \
                status, error_message, is_managed, created_at \
         FROM gateway_requests \
         WHERE org_id = $1 \
           AND ($2::timestamptz IS NULL OR created_at >= $2) \
           AND ($3::timestamptz IS NULL OR created_at < $3) \
           AND ($4::uuid IS NULL OR key_id = $4) \
           AND ($5::varchar IS NULL OR model_requested = $5 OR model_used = $5) \
           AND ($6::varchar IS NULL OR status = $6) \
         ORDER BY created_at DESC \
         LIMIT $7 OFFSET $8",
    )
    .bind(org_id)
    .bind(filter.from)
    .bind(filter.to)
    .bind(filter.key_id)
    .bind(&filter.model)
    .bind(&filter.status)
    .bind(limit)
    .bind(filter.offset.max(0))
    .fetch_all(db)
    .await
}

#[derive(Debug, Serialize)]
pub struct UsageSummary {
    pub total_requests: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_cost: f64,
    pub by_model: Vec<ModelUsage>,
    pub by_day: Vec<DailyUsage>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ModelUsage {
    pub model: String,
    pub requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: f64,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct DailyUsage {
    pub day: chrono::NaiveDate,
    pub requests: i64,
    pub cost: f64,
}

/// Rollups for the usage endpoint, over an optional time range.
pub async fn usage_summary(
    db: &PgPool,
    org_id: Uuid,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> sqlx::Result<UsageSummary> {
    let totals = sqlx::query(
        "SELECT COUNT(*) AS requests, \
                COALESCE(SUM(input_tokens), 0)::bigint AS input_tokens, \
                COALESCE(SUM(output_tokens), 0)::bigint AS output_tokens, \
                COALESCE(SUM(cost), 0)::double precision AS cost \
         FROM gateway_requests \
         WHERE org_id = $1 \
           AND ($2::timestamptz IS NULL OR created_at >= $2) \
           AND ($3::timestamptz IS NULL OR created_at < $3)",
    )
    .bind(org_id)
    .bind(from)
    .bind(to)
    .fetch_one(db)
    .await?;

    let by_model = sqlx::query_as::<_, ModelUsage>(
        "SELECT COALESCE(model_used, model_requested) AS model, \
                COUNT(*) AS requests, \
                COALESCE(SUM(input_tokens), 0)::bigint AS input_tokens, \
                COALESCE(SUM(output_tokens), 0)::bigint AS output_tokens, \
                COALESCE(SUM(cost), 0)::double precision AS cost \
         FROM gateway_requests \
         WHERE org_id = $1 \
           AND ($2::timestamptz IS NULL OR created_at >= $2) \
           AND ($3::timestamptz IS NULL OR created_at < $3) \
         GROUP BY 1 ORDER BY cost DESC",
    )
    .bind(org_id)
    .bind(from)
    .bind(to)
    .fetch_all(db)
    .await?;

    let by_day = sqlx::query_as::<_, DailyUsage>(
        "SELECT created_at::date AS day, \
                COUNT(*) AS requests, \
                COALESCE(SUM(cost), 0)::double precision AS cost \
         FROM gateway_requests \
         WHERE org_id = $1 \
           AND ($2::timestamptz IS NULL OR created_at >= $2) \
           AND ($3::timestamptz IS NULL OR created_at < $3) \
         GROUP BY 1 ORDER BY 1",
    )
    .bind(org_id)
    .bind(from)
    .bind(to)
    .fetch_all(db)
    .await?;

    Ok(UsageSummary {
        total_requests: totals.try_get::<i64, _>("requests")?,
        total_input_tokens: totals.try_get::<i64, _>("input_tokens")?,
        total_output_tokens: totals.try_get::<i64, _>("output_tokens")?,
        total_cost: totals.try_get::<f64, _>("cost")?,
        by_model,
        by_day,
    })
}

/// Best-effort durable mirror of one rate-limit window hit. Used by the
/// recorder for rate-limited rejections only.
pub async fn upsert_rate_limit_mirror(
    db: &PgPool,
    key_id: Uuid,
    window_start: DateTime<Utc>,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO gateway_rate_limits (key_id, window_start, request_count) \
         VALUES ($1, $2, 1) \
         ON CONFLICT (key_id, window_start) \
         DO UPDATE SET request_count = gateway_rate_limits.request_count + 1",
    )
    .bind(key_id)
    .bind(window_start)
    .execute(db)
    .await?;
    Ok(())
}
