//! Audit middleware — writes `audit_logs` rows for sensitive endpoints.
//!
//! Triggers on mutating methods to the audited path set: provider connect,
//! auth flows, and every gateway invocation (`/v1/*`). The row is written
//! after the handler returns so it can capture the final status code and
//! latency; the write runs on a detached task and can never fail the request.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};
use serde_json::json;
use uuid::Uuid;

use crate::state::AppState;

/// Path prefixes that always audit on mutating methods.
const AUDITED_PREFIXES: &[&str] = &["/api/providers/connect", "/api/auth/"];

/// Org used for entries with no authenticated principal (failed auth on
/// audited paths). Operators seed this sentinel org in the database.
const UNATTRIBUTED_ORG: Uuid = Uuid::from_u128(1);

pub(crate) fn should_audit(path: &str, method: &Method) -> bool {
    if matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS) {
        return false;
    }
    path.starts_with("/v1/")
        || path.contains("/invoke")
        || AUDITED_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// `(action, resource_type)` from the request shape.
pub(crate) fn derive_action(method: &Method, path: &str) -> (&'static str, &'static str) {
    if path.starts_with("/v1/") || path.contains("/invoke") {
        return ("invoke", "model");
    }
    if path.contains("/connect") {
        return ("connect", "provider");
    }
    if path.contains("/auth/") {
        if path.contains("login") {
            return ("login", "auth");
        }
        if path.contains("register") {
            return ("register", "auth");
        }
        return ("auth_action", "auth");
    }
    match *method {
        Method::POST => ("create", "unknown"),
        Method::DELETE => ("delete", "unknown"),
        _ => ("update", "unknown"),
    }
}

/// First UUID-shaped path segment, if any — usually the resource being acted
/// upon.
pub(crate) fn extract_resource_id(path: &str) -> Option<String> {
    path.split('/')
        .find(|segment| Uuid::parse_str(segment).is_ok())
        .map(str::to_string)
}

fn client_ip(req: &Request) -> Option<String> {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
}

pub async fn audit_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    if !should_audit(&path, &method) {
        return next.run(req).await;
    }

    let ip = client_ip(&req);
    let request_id = req
        .extensions()
        .get::<super::admission::RequestId>()
        .map(|id| id.0.clone());

    let started = std::time::Instant::now();
    let response = next.run(req).await;
    let latency_ms = started.elapsed().as_millis() as u64;
    let status_code = response.status().as_u16();

    // Principal set by whichever auth middleware ran for this route.
    let (org_id, user_id) = principal_of(&response);

    let (action, resource_type) = derive_action(&method, &path);
    let resource_id = extract_resource_id(&path);
    let details = json!({
        "method": method.as_str(),
        "path": path,
        "status_code": status_code,
        "latency_ms": latency_ms,
        "request_id": request_id,
    });

    // Fire-and-forget; audit can never break the request path.
    let db = state.db.clone();
    tokio::spawn(async move {
        let entry = crate::db::audit::NewAuditLog {
            org_id: org_id.unwrap_or(UNATTRIBUTED_ORG),
            user_id,
            action,
            resource_type,
            resource_id: resource_id.as_deref(),
            details,
            ip_address: ip.as_deref(),
            user_name: None,
        };
        if let Err(e) = crate::db::audit::insert(&db, entry).await {
            tracing::warn!(error = %e, "failed to write audit log");
        }
    });

    response
}

/// Read the authenticated principal back off the response extensions.
///
/// Handlers (and auth middleware) run inside this middleware, so their
/// request extensions are gone by the time the response returns; the auth
/// layers re-insert the principal into response extensions for exactly this
/// consumer.
fn principal_of(response: &Response) -> (Option<Uuid>, Option<Uuid>) {
    if let Some(user) = response.extensions().get::<super::session_auth::SessionUser>() {
        return (Some(user.org_id), Some(user.user_id));
    }
    if let Some(key) = response
        .extensions()
        .get::<crate::gateway::auth::AuthenticatedKey>()
    {
        return (Some(key.0.org_id), None);
    }
    (None, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_invocations_are_audited() {
        assert!(should_audit("/v1/chat/completions", &Method::POST));
        assert!(should_audit("/v1/embeddings", &Method::POST));
        assert!(!should_audit("/v1/models", &Method::GET));
    }

    #[test]
    fn sensitive_prefixes_are_audited_on_mutation_only() {
        assert!(should_audit("/api/providers/connect", &Method::POST));
        assert!(should_audit("/api/auth/login", &Method::POST));
        assert!(!should_audit("/api/auth/login", &Method::GET));
        assert!(!should_audit("/api/gateway/keys", &Method::POST));
    }

    #[test]
    fn action_derivation_matches_path_families() {
        assert_eq!(
            derive_action(&Method::POST, "/v1/chat/completions"),
            ("invoke", "model")
        );
        assert_eq!(
            derive_action(&Method::POST, "/api/routing/invoke"),
            ("invoke", "model")
        );
        assert_eq!(
            derive_action(&Method::POST, "/api/providers/connect"),
            ("connect", "provider")
        );
        assert_eq!(
            derive_action(&Method::POST, "/api/auth/login"),
            ("login", "auth")
        );
    }

    #[test]
    fn resource_id_is_first_uuid_segment() {
        let id = Uuid::new_v4();
        assert_eq!(
            extract_resource_id(&format!("/api/providers/{id}/invoke")),
            Some(id.to_string())
        );
        assert_eq!(extract_resource_id("/api/providers/connect"), None);
    }
}
