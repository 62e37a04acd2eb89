//! Health endpoints: dependency-free liveness and a readiness probe that
//! checks the database, the cache, and the secret store concurrently.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::{json, Value};

use crate::state::AppState;

/// `GET /api/health` — always 200; safe as a container liveness probe.
pub async fn liveness() -> impl IntoResponse {
    Json(json!({ "status": "alive", "service": "bonito-gateway" }))
}

/// `GET /api/health/ready` — 200 when every dependency answers, 503 with
/// per-dependency detail otherwise.
pub async fn readiness(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (db, cache, vault) = tokio::join!(
        check_database(&state),
        check_cache(&state),
        check_vault(&state),
    );

    let all_healthy = [&db, &cache, &vault]
        .iter()
        .all(|check| check["status"] == "healthy");

    let body = json!({
        "status": if all_healthy { "healthy" } else { "degraded" },
        "service": "bonito-gateway",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "dependencies": { "database": db, "cache": cache, "vault": vault },
    });

    let status = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn check_database(state: &AppState) -> Value {
    let started = std::time::Instant::now();
    match sqlx::query("SELECT 1").execute(&state.db).await {
        Ok(_) => json!({ "status": "healthy", "latency_ms": started.elapsed().as_millis() as u64 }),
        Err(e) => json!({ "status": "unhealthy", "error": e.to_string() }),
    }
}

async fn check_cache(state: &AppState) -> Value {
    let started = std::time::Instant::now();
    let result = async {
        let mut conn = state.cache.get().await.map_err(|e| e.to_string())?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| e.to_string())
    }
    .await;
    match result {
        Ok(_) => json!({ "status": "healthy", "latency_ms": started.elapsed().as_millis() as u64 }),
        Err(e) => json!({ "status": "unhealthy", "error": e }),
    }
}

async fn check_vault(state: &AppState) -> Value {
    match state.secrets.health_check().await {
        Ok(()) => json!({ "status": "healthy" }),
        Err(e) => json!({ "status": "unhealthy", "error": e.to_string() }),
    }
}
