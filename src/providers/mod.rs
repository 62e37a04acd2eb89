//! Upstream provider adapters and the unified dispatch interface.
//!
//! [`ProviderClient`] is an enum that wraps a concrete adapter chosen at
//! construction time from the provider row's `provider_type`. All gateway
//! code interacts with one API (`invoke`, `invoke_stream`, `list_models`,
//! `validate_credentials`, `get_costs`, `health_check`); protocol differences
//! — schema translation, auth headers, endpoint paths — are fully
//! encapsulated in the adapter modules.
//!
//! Adapters fail with [`InvokeError`], categorised so the routing engine can
//! decide between retrying, advancing the fallback chain, and surfacing the
//! error to the caller.

mod anthropic;
mod bedrock;
mod openai;
pub mod pricing;

pub use anthropic::AnthropicAdapter;
pub use bedrock::BedrockAdapter;
pub use openai::OpenAICompatAdapter;

use std::{pin::Pin, sync::Arc, sync::OnceLock, time::Duration};

use bytes::Bytes;
use chrono::NaiveDate;
use dashmap::DashMap;
use futures_util::Stream;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// A `Send`-able, heap-allocated SSE byte stream in OpenAI wire format.
pub type SseStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

/// Which gateway operation is being proxied. Selects the upstream path and
/// response schema; the pipeline is otherwise identical for all three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Chat,
    Completion,
    Embedding,
}

/// Categorised upstream failure. The category, not the message, drives the
/// fallback chain.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("invalid upstream credentials: {0}")]
    InvalidCredentials(String),
    #[error("model not found upstream: {0}")]
    ModelNotFound(String),
    #[error("upstream rate limited: {0}")]
    RateLimitedUpstream(String),
    #[error("context window exceeded: {0}")]
    ContextWindowExceeded(String),
    /// Retryable: transport failures, timeouts, 5xx.
    #[error("transient upstream error: {0}")]
    Transient(String),
    /// Non-retryable upstream rejection with its HTTP status.
    #[error("upstream returned HTTP {status}: {message}")]
    Permanent { status: u16, message: String },
}

impl InvokeError {
    /// Classify an upstream HTTP error response.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = truncate(body, 600);
        match status {
            401 | 403 => Self::InvalidCredentials(message),
            404 => Self::ModelNotFound(message),
            429 => Self::RateLimitedUpstream(message),
            408 => Self::Transient(message),
            400 if looks_like_context_overflow(body) => Self::ContextWindowExceeded(message),
            s if s >= 500 => Self::Transient(message),
            s => Self::Permanent { status: s, message },
        }
    }

    /// Whether the same candidate should be retried before advancing.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether the error originates from the client's own request and must
    /// surface immediately instead of trying further candidates.
    pub fn client_origin(&self) -> bool {
        match self {
            Self::ContextWindowExceeded(_) => true,
            Self::Permanent { status, .. } => matches!(status, 400 | 404 | 413),
            _ => false,
        }
    }

    /// Final mapping to the client-facing error once the chain is exhausted
    /// or a client-origin error short-circuits.
    pub fn into_gateway_error(self) -> crate::error::GatewayError {
        use crate::error::GatewayError;
        match self {
            Self::ModelNotFound(m) => GatewayError::NotFound(format!("model not found: {m}")),
            Self::ContextWindowExceeded(m) => {
                GatewayError::validation(format!("context window exceeded: {m}"))
            }
            Self::Permanent { status: 400, message } => GatewayError::validation(message),
            Self::Permanent { status: 413, .. } => GatewayError::PayloadTooLarge,
            other => GatewayError::UpstreamFailed(other.to_string()),
        }
    }
}

fn looks_like_context_overflow(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("context")
        && (lower.contains("length") || lower.contains("window") || lower.contains("too long"))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

/// Catalog entry returned by `list_models`.
#[derive(Debug, Clone, Serialize)]
pub struct ModelListing {
    pub model_id: String,
    pub display_name: String,
    pub context_window: u32,
    pub input_price_per_1m: f64,
    pub output_price_per_1m: f64,
    pub streaming_supported: bool,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialInfo {
    pub valid: bool,
    pub account_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyCost {
    pub date: NaiveDate,
    pub amount: f64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CostData {
    pub total: f64,
    pub currency: String,
    pub daily_costs: Vec<DailyCost>,
}

impl CostData {
    pub fn empty() -> Self {
        Self {
            total: 0.0,
            currency: "USD".into(),
            daily_costs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub latency_ms: u64,
}

/// Token counts and cost realised by one invocation, extracted from the
/// upstream response (or coalesced from the final stream frame).
#[derive(Debug, Clone)]
pub struct InvocationMetrics {
    pub model_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: f64,
    pub price_known: bool,
}

impl InvocationMetrics {
    /// Read `usage` out of an OpenAI-shaped response body. When the upstream
    /// omits usage entirely, fall back to a tokenizer estimate over the
    /// request and response text.
    pub fn from_response(model_id: &str, request: &Value, response: &Value) -> Self {
        let usage = response.get("usage");
        let input_tokens = usage
            .and_then(|u| u.get("prompt_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or_else(|| estimate_tokens(&prompt_text(request)));
        let output_tokens = usage
            .and_then(|u| u.get("completion_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or_else(|| estimate_tokens(&completion_text(response)));
        Self::from_counts(model_id, input_tokens, output_tokens)
    }

    pub fn from_counts(model_id: &str, input_tokens: u64, output_tokens: u64) -> Self {
        let (estimated_cost, price_known) =
            pricing::estimate_cost(model_id, input_tokens, output_tokens);
        Self {
            model_id: model_id.to_string(),
            input_tokens,
            output_tokens,
            estimated_cost,
            price_known,
        }
    }
}

/// Concatenated text content of an OpenAI-shaped request, for estimation.
fn prompt_text(request: &Value) -> String {
    if let Some(messages) = request.get("messages").and_then(Value::as_array) {
        return messages
            .iter()
            .filter_map(|m| m.get("content").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n");
    }
    match request.get("prompt").or_else(|| request.get("input")) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn completion_text(response: &Value) -> String {
    response
        .pointer("/choices/0/message/content")
        .or_else(|| response.pointer("/choices/0/text"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Tokenizer-based estimate for upstreams that omit usage. cl100k is close
/// enough across vendors for billing-estimate purposes.
pub fn estimate_tokens(text: &str) -> u64 {
    static BPE: OnceLock<tiktoken_rs::CoreBPE> = OnceLock::new();
    if text.is_empty() {
        return 0;
    }
    let bpe = BPE.get_or_init(|| tiktoken_rs::cl100k_base().expect("embedded cl100k vocabulary"));
    bpe.encode_with_special_tokens(text).len() as u64
}

/// Unified upstream client — enum dispatch over concrete provider adapters.
#[derive(Debug)]
pub enum ProviderClient {
    /// OpenAI protocol passthrough: OpenAI, Azure OpenAI, Groq.
    OpenAICompat(OpenAICompatAdapter),
    /// Anthropic Messages API with request/response translation.
    Anthropic(AnthropicAdapter),
    /// AWS Bedrock Converse API (bearer API-key auth).
    Bedrock(BedrockAdapter),
}

/// Socket behaviour shared by every adapter.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const STREAM_TIMEOUT: Duration = Duration::from_secs(300);

impl ProviderClient {
    /// Build a client from a provider row's type and decrypted credentials.
    ///
    /// `master_key` overrides the org credential for managed-inference
    /// providers — the platform's key is used and usage billed with markup.
    pub fn from_credentials(
        provider_type: &str,
        credentials: &Value,
        master_key: Option<String>,
    ) -> Result<Self, InvokeError> {
        let api_key = master_key.or_else(|| {
            credentials
                .get("api_key")
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        match provider_type {
            "openai" => {
                let key = api_key.ok_or_else(|| missing_credential("api_key"))?;
                Ok(Self::OpenAICompat(OpenAICompatAdapter::bearer(
                    "https://api.openai.com".into(),
                    key,
                )))
            }
            "groq" => {
                let key = api_key.ok_or_else(|| missing_credential("api_key"))?;
                Ok(Self::OpenAICompat(OpenAICompatAdapter::bearer(
                    "https://api.groq.com/openai".into(),
                    key,
                )))
            }
            "azure" => {
                let key = api_key.ok_or_else(|| missing_credential("api_key"))?;
                let endpoint = credentials
                    .get("endpoint")
                    .and_then(Value::as_str)
                    .ok_or_else(|| missing_credential("endpoint"))?;
                // Azure's OpenAI-compatible surface lives under /openai on the
                // resource endpoint and authenticates with an api-key header.
                Ok(Self::OpenAICompat(OpenAICompatAdapter::api_key_header(
                    format!("{}/openai", endpoint.trim_end_matches('/')),
                    key,
                )))
            }
            "anthropic" => {
                let key = api_key.ok_or_else(|| missing_credential("api_key"))?;
                Ok(Self::Anthropic(AnthropicAdapter::new(
                    "https://api.anthropic.com".into(),
                    key,
                )))
            }
            "aws" => {
                let key = api_key.ok_or_else(|| missing_credential("api_key"))?;
                let region = credentials
                    .get("region")
                    .and_then(Value::as_str)
                    .unwrap_or("us-east-1");
                Ok(Self::Bedrock(BedrockAdapter::new(region, key)))
            }
            other => Err(InvokeError::Permanent {
                status: 400,
                message: format!("unknown provider type `{other}`"),
            }),
        }
    }

    /// Whether this adapter can serve `stream = true` requests. Streaming
    /// requests skip candidates that cannot.
    pub fn supports_streaming(&self) -> bool {
        match self {
            Self::OpenAICompat(_) | Self::Anthropic(_) => true,
            Self::Bedrock(_) => false,
        }
    }

    /// Forward one request. `body` is OpenAI-shaped with `model` and `stream`
    /// already rewritten by the pipeline; the response is OpenAI-shaped.
    pub async fn invoke(&self, kind: RequestKind, body: Value) -> Result<Value, InvokeError> {
        match self {
            Self::OpenAICompat(a) => a.invoke(kind, body).await,
            Self::Anthropic(a) => a.invoke(kind, body).await,
            Self::Bedrock(a) => a.invoke(kind, body).await,
        }
    }

    /// Forward a streaming request and return an OpenAI-format SSE stream.
    pub async fn invoke_stream(
        &self,
        kind: RequestKind,
        body: Value,
    ) -> Result<SseStream, InvokeError> {
        match self {
            Self::OpenAICompat(a) => a.invoke_stream(kind, body).await,
            Self::Anthropic(a) => a.invoke_stream(kind, body).await,
            Self::Bedrock(_) => Err(InvokeError::Permanent {
                status: 400,
                message: format!("streaming is not supported for bedrock models ({kind:?})"),
            }),
        }
    }

    pub async fn validate_credentials(&self) -> Result<CredentialInfo, InvokeError> {
        match self {
            Self::OpenAICompat(a) => a.validate_credentials().await,
            Self::Anthropic(a) => a.validate_credentials().await,
            Self::Bedrock(a) => a.validate_credentials().await,
        }
    }

    pub async fn list_models(&self) -> Result<Vec<ModelListing>, InvokeError> {
        match self {
            Self::OpenAICompat(a) => a.list_models().await,
            Self::Anthropic(a) => a.list_models().await,
            Self::Bedrock(a) => a.list_models().await,
        }
    }

    /// Billing data for a date range. Only OpenAI exposes a usable costs API;
    /// the other adapters return an empty window (gateway-side accounting in
    /// `gateway_requests` remains the source of truth).
    pub async fn get_costs(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<CostData, InvokeError> {
        match self {
            Self::OpenAICompat(a) => a.get_costs(start, end).await,
            Self::Anthropic(_) | Self::Bedrock(_) => Ok(CostData::empty()),
        }
    }

    pub async fn health_check(&self) -> HealthStatus {
        let start = std::time::Instant::now();
        let healthy = match self {
            Self::OpenAICompat(a) => a.probe().await.is_ok(),
            Self::Anthropic(a) => a.probe().await.is_ok(),
            Self::Bedrock(a) => a.probe().await.is_ok(),
        };
        HealthStatus {
            healthy,
            latency_ms: start.elapsed().as_millis() as u64,
        }
    }
}

fn missing_credential(field: &str) -> InvokeError {
    InvokeError::InvalidCredentials(format!("credential field `{field}` is missing"))
}

/// Lazily-built cache of provider clients keyed by provider row ID.
///
/// Clients hold reqwest connection pools; building one per request would
/// defeat connection reuse. Entries are inserted once and never mutated —
/// credential rotation deletes the row's entry via [`invalidate`].
///
/// [`invalidate`]: ProviderClientCache::invalidate
#[derive(Default)]
pub struct ProviderClientCache {
    clients: DashMap<Uuid, Arc<ProviderClient>>,
}

impl ProviderClientCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build<F>(&self, provider_id: Uuid, build: F) -> Result<Arc<ProviderClient>, InvokeError>
    where
        F: FnOnce() -> Result<ProviderClient, InvokeError>,
    {
        if let Some(existing) = self.clients.get(&provider_id) {
            return Ok(Arc::clone(&existing));
        }
        let client = Arc::new(build()?);
        self.clients.insert(provider_id, Arc::clone(&client));
        Ok(client)
    }

    pub fn invalidate(&self, provider_id: Uuid) {
        self.clients.remove(&provider_id);
    }
}
