//! Admission middleware: request IDs, body-size cap, CORS, and security
//! headers.
//!
//! Every inbound request is assigned an `X-Request-ID` — accepted from the
//! caller if present, freshly generated otherwise — stored as an extension
//! for handlers and echoed on the response, uniformly across error paths.
//! The body cap runs here, before any rate-limit counter is consumed, so
//! oversized payloads cannot burn quota.

use axum::{
    extract::Request,
    http::{header, HeaderValue, Method},
    middleware::Next,
    response::Response,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    set_header::SetResponseHeaderLayer,
};
use tracing::Instrument as _;
use uuid::Uuid;

use crate::error::GatewayError;

/// Newtype wrapper carrying the assigned request ID, readable by any handler
/// via `Extension<RequestId>`.
#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Axum middleware assigning a [`RequestId`] and enforcing the body cap.
///
/// Placed outermost (just inside the trace layer) so every response — success
/// or error — carries the ID header.
pub async fn admission_middleware(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestId(id.clone()));

    // Declared-length check; RequestBodyLimitLayer backstops chunked bodies.
    let limit = req
        .extensions()
        .get::<BodyLimit>()
        .map(|l| l.0)
        .unwrap_or(1024 * 1024);
    let declared = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if matches!(declared, Some(len) if len > limit) {
        let mut response = GatewayError::PayloadTooLarge.into_envelope(Some(&id), true);
        attach_id(&mut response, &id);
        return response;
    }

    let span = tracing::debug_span!("request", id = %id);
    let mut response = next.run(req).instrument(span).await;
    attach_id(&mut response, &id);
    response
}

fn attach_id(response: &mut Response, id: &str) {
    if let Ok(value) = HeaderValue::from_str(id) {
        response.headers_mut().insert("x-request-id", value);
    }
}

/// Marker extension carrying the configured body cap into the middleware.
#[derive(Clone, Copy)]
pub struct BodyLimit(pub usize);

/// Middleware injecting [`BodyLimit`] ahead of [`admission_middleware`].
pub async fn body_limit_middleware(limit: usize, mut req: Request, next: Next) -> Response {
    req.extensions_mut().insert(BodyLimit(limit));
    next.run(req).await
}

/// CORS layer for the configured origin set.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(parsed))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

/// Static security headers applied to every response.
pub fn security_header_layers() -> (
    SetResponseHeaderLayer<HeaderValue>,
    SetResponseHeaderLayer<HeaderValue>,
    SetResponseHeaderLayer<HeaderValue>,
) {
    (
        SetResponseHeaderLayer::if_not_present(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        ),
        SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ),
        SetResponseHeaderLayer::if_not_present(
            header::REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, middleware, routing::get, Extension, Router};
    use tower::ServiceExt;

    async fn echo_id(Extension(RequestId(id)): Extension<RequestId>) -> String {
        id
    }

    fn app() -> Router {
        Router::new()
            .route("/", get(echo_id))
            .layer(middleware::from_fn(admission_middleware))
    }

    #[tokio::test]
    async fn generates_and_echoes_a_request_id() {
        let resp = app()
            .oneshot(axum::http::Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let header = resp.headers().get("x-request-id").unwrap().to_str().unwrap();
        assert!(Uuid::parse_str(header).is_ok());
    }

    #[tokio::test]
    async fn caller_supplied_request_id_is_preserved() {
        let resp = app()
            .oneshot(
                axum::http::Request::get("/")
                    .header("x-request-id", "trace-me-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.headers().get("x-request-id").unwrap(), "trace-me-123");
        let body = axum::body::to_bytes(resp.into_body(), 256).await.unwrap();
        assert_eq!(&body[..], b"trace-me-123");
    }

    #[tokio::test]
    async fn oversized_declared_body_is_rejected_before_handlers() {
        let app = Router::new()
            .route("/", get(echo_id))
            .layer(middleware::from_fn(admission_middleware))
            .layer(middleware::from_fn(|req, next| {
                body_limit_middleware(64, req, next)
            }));

        let resp = app
            .oneshot(
                axum::http::Request::get("/")
                    .header("content-length", "1000000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
        // Envelope still carries the request id header.
        assert!(resp.headers().get("x-request-id").is_some());
    }
}
