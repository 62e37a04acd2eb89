use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{middleware, routing::get, Router};
use tokio::signal;
use tower_http::{
    compression::{
        predicate::{NotForContentType, Predicate as _, SizeAbove},
        CompressionLayer,
    },
    limit::RequestBodyLimitLayer,
};
use tracing::info;

mod api;
mod config;
mod crypto;
mod db;
mod error;
mod gateway;
mod providers;
mod secrets;
mod state;

pub use config::Settings;
pub use error::GatewayError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a container HEALTHCHECK, hit /api/health and exit
    // immediately. Avoids needing curl/wget in the image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    // .env is a dev convenience; absence is fine.
    let _ = dotenvy::dotenv();

    let settings = Settings::from_env().context("loading configuration")?;
    config::set_production(settings.production());

    // Initialise tracing: JSON logs in production, human-readable in dev.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "bonito_gateway=info,tower_http=warn".into());
    if settings.production() {
        tracing_subscriber::fmt().with_env_filter(env_filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    info!(
        port = settings.port,
        environment = ?settings.environment,
        "bonito-gateway starting"
    );

    let state = state::AppState::connect(settings).await?;

    let addr: SocketAddr = format!("0.0.0.0:{}", state.settings.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    let app = build_app(Arc::clone(&state));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

/// Compose the full application.
///
/// The middleware chain is explicit and fixed; execution order (outermost
/// first): trace → gzip → security headers → CORS → body-cap marker →
/// admission (request id + declared-length reject) → body-limit backstop →
/// audit → per-surface auth → handler.
fn build_app(state: Arc<state::AppState>) -> Router {
    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));

    // The gateway surface, guarded by key auth.
    let v1 = api::v1::router(Arc::clone(&state)).layer(middleware::from_fn_with_state(
        Arc::clone(&state),
        gateway::auth::key_auth_middleware,
    ));

    // The management plane, guarded by session auth.
    let management = Router::new()
        .merge(api::keys::router(Arc::clone(&state)))
        .merge(api::requests::router(Arc::clone(&state)))
        .merge(api::org_config::router(Arc::clone(&state)))
        .merge(api::policies::router(Arc::clone(&state)))
        .merge(api::providers::router(Arc::clone(&state)))
        .merge(api::admin::router(Arc::clone(&state)))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            api::session_auth::session_auth_middleware,
        ));

    // Health endpoints sit outside both auth layers.
    let health = Router::new()
        .route("/api/health", get(api::health::liveness))
        .route("/api/health/ready", get(api::health::readiness))
        .with_state(Arc::clone(&state));

    let body_limit = state.settings.body_limit_bytes;
    let (hsts, nosniff, referrer) = api::admission::security_header_layers();

    // gzip for sizeable bodies, but never for the SSE proxy stream.
    let compression = CompressionLayer::new()
        .compress_when(SizeAbove::new(1024).and(NotForContentType::new("text/event-stream")));

    Router::new()
        .merge(v1)
        .merge(management)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            api::audit::audit_middleware,
        ))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(middleware::from_fn(api::admission::admission_middleware))
        .layer(middleware::from_fn(move |req, next| {
            api::admission::body_limit_middleware(body_limit, req, next)
        }))
        .layer(api::admission::cors_layer(&state.settings.allowed_origins()))
        .layer(hsts)
        .layer(nosniff)
        .layer(referrer)
        .layer(compression)
        .layer(trace_layer)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

/// Lightweight healthcheck: GET /api/health and exit 0 on 200, 1 otherwise.
/// Invoked via `bonito-gateway --healthcheck` from a container HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/api/health");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}
