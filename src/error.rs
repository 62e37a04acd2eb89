//! Unified error type and HTTP error envelope.
//!
//! [`GatewayError`] is the one error type request handlers return; `?` works
//! for anything convertible into `anyhow::Error` via the [`Internal`]
//! variant's `From` impl. Conversion to HTTP happens in one place, producing
//! the uniform envelope:
//!
//! ```json
//! { "success": false,
//!   "error": { "code": "rate_limited", "message": "...", "field": null },
//!   "request_id": "..." }
//! ```
//!
//! Internal errors are redacted in production except on `/v1/*` paths, where
//! the real message is always surfaced — gateway callers are developers
//! debugging their own integration.
//!
//! [`Internal`]: GatewayError::Internal

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Malformed or semantically invalid payload — 422.
    #[error("{message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Missing, malformed, or expired session token — 401.
    #[error("{0}")]
    Auth(String),

    /// Unknown, malformed, or revoked gateway key — 401 with the
    /// gateway-surface error code.
    #[error("{0}")]
    InvalidKey(String),

    /// The subscription tier does not include the feature — 402.
    #[error("{0}")]
    UpgradeRequired(String),

    /// Authenticated but not allowed (scope, allow-list) — 403.
    #[error("{0}")]
    Forbidden(String),

    /// 404.
    #[error("{0}")]
    NotFound(String),

    /// Request body exceeded the admission cap — 413.
    #[error("request body exceeds the configured size limit")]
    PayloadTooLarge,

    /// Per-key fixed-window limit exhausted — 429 with Retry-After.
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    /// All routing candidates failed with a non-retryable upstream error — 502.
    #[error("upstream provider error: {0}")]
    UpstreamFailed(String),

    /// The per-request deadline expired — 504.
    #[error("gateway deadline exceeded")]
    Timeout,

    /// A required dependency (cache, database) is down — 503.
    /// Rate limiting fails closed through this variant.
    #[error("{0}")]
    ServiceUnavailable(String),

    /// Anything else — 500, redacted in production.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn validation_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Auth(_) | Self::InvalidKey(_) => StatusCode::UNAUTHORIZED,
            Self::UpgradeRequired(_) => StatusCode::PAYMENT_REQUIRED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamFailed(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation_error",
            Self::Auth(_) => "invalid_token",
            Self::InvalidKey(_) => "invalid_key",
            Self::UpgradeRequired(_) => "upgrade_required",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::PayloadTooLarge => "payload_too_large",
            Self::RateLimited { .. } => "rate_limited",
            Self::UpstreamFailed(_) => "upstream_error",
            Self::Timeout => "gateway_timeout",
            Self::ServiceUnavailable(_) => "service_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Render the envelope, attaching the request ID when the caller has one.
    ///
    /// `expose_internal` forces the real message of [`Internal`] errors into
    /// the body regardless of environment; the `/v1/*` handlers pass `true`.
    ///
    /// [`Internal`]: GatewayError::Internal
    pub fn into_envelope(self, request_id: Option<&str>, expose_internal: bool) -> Response {
        let status = self.status();
        let code = self.code();

        if status.is_server_error() {
            tracing::error!(code, error = %self, "request failed");
        } else {
            tracing::warn!(code, error = %self, "request rejected");
        }

        let message = match &self {
            Self::Internal(_) if crate::config::production() && !expose_internal => {
                "Something went wrong. Please try again or contact support.".to_string()
            }
            other => other.to_string(),
        };
        let field = match &self {
            Self::Validation { field, .. } => field.clone(),
            _ => None,
        };

        let body = Json(json!({
            "success": false,
            "error": { "code": code, "message": message, "field": field },
            "request_id": request_id,
        }));

        match self {
            Self::RateLimited { retry_after_secs } => (
                status,
                [("retry-after", retry_after_secs.to_string())],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.into_envelope(None, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn envelope_json(err: GatewayError, expose: bool) -> serde_json::Value {
        let resp = err.into_envelope(Some("req-1"), expose);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn status_and_code_mapping() {
        assert_eq!(
            GatewayError::validation("x").status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            GatewayError::Auth("bad key".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::UpgradeRequired("routing".into()).status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            GatewayError::RateLimited {
                retry_after_secs: 10
            }
            .code(),
            "rate_limited"
        );
        assert_eq!(GatewayError::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            GatewayError::ServiceUnavailable("cache down".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn envelope_carries_code_message_and_request_id() {
        let json = envelope_json(GatewayError::NotFound("no such key".into()), false).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "not_found");
        assert_eq!(json["error"]["message"], "no such key");
        assert_eq!(json["request_id"], "req-1");
    }

    #[tokio::test]
    async fn validation_envelope_carries_field() {
        let json = envelope_json(
            GatewayError::validation_field("weights must sum to 100", "models"),
            false,
        )
        .await;
        assert_eq!(json["error"]["field"], "models");
    }

    #[tokio::test]
    async fn rate_limited_sets_retry_after_header() {
        let resp = GatewayError::RateLimited {
            retry_after_secs: 42,
        }
        .into_envelope(None, false);
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("retry-after").unwrap(), "42");
    }

    #[tokio::test]
    async fn internal_message_survives_when_exposed() {
        let json = envelope_json(
            GatewayError::Internal(anyhow::anyhow!("pool exhausted")),
            true,
        )
        .await;
        assert_eq!(json["error"]["message"], "pool exhausted");
    }
}
