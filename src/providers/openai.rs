//! OpenAI-compatible adapter.
//!
//! Handles any upstream that speaks the OpenAI protocol — OpenAI itself,
//! Azure OpenAI (via the `/openai` resource surface and `api-key` header),
//! and Groq. Request bodies are forwarded verbatim; no schema translation is
//! performed, which is what makes the gateway's `/v1/*` surface bit-compatible.

use chrono::NaiveDate;
use futures_util::StreamExt as _;
use reqwest::{header, Client};
use serde_json::Value;

use super::{
    pricing, CostData, CredentialInfo, DailyCost, InvokeError, ModelListing, RequestKind,
    SseStream, CONNECT_TIMEOUT, READ_TIMEOUT, STREAM_TIMEOUT,
};

/// Adapter for any OpenAI-compatible upstream.
#[derive(Debug)]
pub struct OpenAICompatAdapter {
    /// Buffered requests — 60 s request timeout.
    client: Client,
    /// Streaming requests — long timeout; the body arrives incrementally.
    stream_client: Client,
    base_url: String,
}

impl OpenAICompatAdapter {
    /// Standard `Authorization: Bearer` auth (OpenAI, Groq).
    pub fn bearer(base_url: String, api_key: String) -> Self {
        let mut headers = header::HeaderMap::new();
        let value = format!("Bearer {api_key}");
        // Panics on invalid header bytes — surfaces misconfiguration when the
        // client is built, not at request time.
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&value)
                .expect("API key contains invalid Authorization header characters"),
        );
        Self::with_headers(base_url, headers)
    }

    /// Azure-style `api-key` header auth.
    pub fn api_key_header(base_url: String, api_key: String) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            "api-key",
            header::HeaderValue::from_str(&api_key)
                .expect("API key contains invalid header characters"),
        );
        Self::with_headers(base_url, headers)
    }

    fn with_headers(base_url: String, headers: header::HeaderMap) -> Self {
        let client = Client::builder()
            .default_headers(headers.clone())
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        let stream_client = Client::builder()
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(STREAM_TIMEOUT)
            .build()
            .expect("failed to build streaming reqwest client");

        Self {
            client,
            stream_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url_for(&self, kind: RequestKind) -> String {
        let path = match kind {
            RequestKind::Chat => "/v1/chat/completions",
            RequestKind::Completion => "/v1/completions",
            RequestKind::Embedding => "/v1/embeddings",
        };
        format!("{}{path}", self.base_url)
    }

    /// Forward one buffered request and return the parsed JSON response.
    pub async fn invoke(&self, kind: RequestKind, body: Value) -> Result<Value, InvokeError> {
        let url = self.url_for(kind);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| InvokeError::Transient(format!("reading response body: {e}")))?;

        if !status.is_success() {
            return Err(InvokeError::from_status(status.as_u16(), &text));
        }

        serde_json::from_str(&text).map_err(|e| InvokeError::Permanent {
            status: status.as_u16(),
            message: format!("upstream returned invalid JSON: {e}"),
        })
    }

    /// Forward a streaming request; the upstream's SSE bytes are proxied
    /// verbatim — no buffering, no schema translation.
    pub async fn invoke_stream(
        &self,
        kind: RequestKind,
        body: Value,
    ) -> Result<SseStream, InvokeError> {
        let url = self.url_for(kind);
        let response = self
            .stream_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(InvokeError::from_status(status.as_u16(), &text));
        }

        let stream = response
            .bytes_stream()
            .map(|r| r.map_err(anyhow::Error::from));
        Ok(Box::pin(stream))
    }

    /// A lightweight identity call: `GET /v1/models` proves the key without
    /// mutating remote state.
    pub async fn validate_credentials(&self) -> Result<CredentialInfo, InvokeError> {
        match self.probe().await {
            Ok(()) => Ok(CredentialInfo {
                valid: true,
                account_id: None,
                message: "credentials accepted".into(),
            }),
            Err(InvokeError::InvalidCredentials(message)) => Ok(CredentialInfo {
                valid: false,
                account_id: None,
                message,
            }),
            Err(other) => Err(other),
        }
    }

    pub async fn list_models(&self) -> Result<Vec<ModelListing>, InvokeError> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| InvokeError::Transient(format!("reading response body: {e}")))?;
        if !status.is_success() {
            return Err(InvokeError::from_status(status.as_u16(), &text));
        }
        let body: Value = serde_json::from_str(&text).map_err(|e| InvokeError::Permanent {
            status: status.as_u16(),
            message: format!("upstream returned invalid JSON: {e}"),
        })?;

        let listings = body
            .get("data")
            .and_then(Value::as_array)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("id").and_then(Value::as_str))
                    .map(|id| {
                        let (input, output) = pricing::price_per_1m(id).unwrap_or((0.0, 0.0));
                        ModelListing {
                            model_id: id.to_string(),
                            display_name: id.to_string(),
                            context_window: pricing::context_window(id).unwrap_or(0),
                            input_price_per_1m: input,
                            output_price_per_1m: output,
                            streaming_supported: true,
                            capabilities: if id.contains("embedding") {
                                vec!["embeddings".into()]
                            } else {
                                vec!["chat".into(), "completion".into()]
                            },
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(listings)
    }

    /// Organization-level billing data. Only real OpenAI serves this path;
    /// compatible upstreams without it yield an empty window rather than an
    /// error so the costs endpoint stays usable across providers.
    pub async fn get_costs(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<CostData, InvokeError> {
        let start_time = start.and_hms_opt(0, 0, 0).map(|t| t.and_utc().timestamp()).unwrap_or(0);
        let end_time = end.and_hms_opt(0, 0, 0).map(|t| t.and_utc().timestamp()).unwrap_or(0);
        let url = format!(
            "{}/v1/organization/costs?start_time={start_time}&end_time={end_time}",
            self.base_url
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Ok(CostData::empty());
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| InvokeError::Transient(format!("reading costs body: {e}")))?;

        let mut daily = Vec::new();
        let mut total = 0.0;
        for bucket in body.get("data").and_then(Value::as_array).into_iter().flatten() {
            let amount = bucket
                .pointer("/results/0/amount/value")
                .and_then(Value::as_f64)
                .unwrap_or(0.0);
            let date = bucket
                .get("start_time")
                .and_then(Value::as_i64)
                .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
                .map(|dt| dt.date_naive());
            if let Some(date) = date {
                total += amount;
                daily.push(DailyCost {
                    date,
                    amount,
                    currency: "USD".into(),
                });
            }
        }
        Ok(CostData {
            total,
            currency: "USD".into(),
            daily_costs: daily,
        })
    }

    /// Liveness probe used by health checks and credential validation.
    pub async fn probe(&self) -> Result<(), InvokeError> {
        let url = format!("{}/v1/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(InvokeError::from_status(status.as_u16(), &text));
        }
        Ok(())
    }
}

fn transport_error(e: reqwest::Error) -> InvokeError {
    InvokeError::Transient(format!("transport error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn adapter_for(server: &MockServer) -> OpenAICompatAdapter {
        OpenAICompatAdapter::bearer(server.uri(), "sk-test".into())
    }

    #[tokio::test]
    async fn invoke_forwards_bearer_auth_and_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "hello" } }],
                "usage": { "prompt_tokens": 5, "completion_tokens": 2 }
            })))
            .mount(&server)
            .await;

        let response = adapter_for(&server)
            .invoke(RequestKind::Chat, json!({ "model": "gpt-4o", "messages": [] }))
            .await
            .unwrap();
        assert_eq!(
            response.pointer("/choices/0/message/content").unwrap(),
            "hello"
        );
    }

    #[tokio::test]
    async fn invoke_selects_path_per_request_kind() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list", "data": [{ "embedding": [0.1], "index": 0 }]
            })))
            .mount(&server)
            .await;

        let result = adapter_for(&server)
            .invoke(
                RequestKind::Embedding,
                json!({ "model": "text-embedding-3-small", "input": "hi" }),
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn upstream_429_classifies_as_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let err = adapter_for(&server)
            .invoke(RequestKind::Chat, json!({ "model": "gpt-4o", "messages": [] }))
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::RateLimitedUpstream(_)));
    }

    #[tokio::test]
    async fn upstream_500_classifies_as_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = adapter_for(&server)
            .invoke(RequestKind::Chat, json!({ "model": "gpt-4o", "messages": [] }))
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Transient(_)));
    }

    #[tokio::test]
    async fn validate_credentials_reports_invalid_without_erroring() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let info = adapter_for(&server).validate_credentials().await.unwrap();
        assert!(!info.valid);
    }

    #[tokio::test]
    async fn list_models_maps_catalog_through_pricing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "data": [
                    { "id": "gpt-4o", "object": "model" },
                    { "id": "text-embedding-3-small", "object": "model" },
                ]
            })))
            .mount(&server)
            .await;

        let models = adapter_for(&server).list_models().await.unwrap();
        assert_eq!(models.len(), 2);
        let gpt4o = models.iter().find(|m| m.model_id == "gpt-4o").unwrap();
        assert_eq!(gpt4o.input_price_per_1m, 2.50);
        assert!(gpt4o.capabilities.contains(&"chat".to_string()));
        let embed = models
            .iter()
            .find(|m| m.model_id == "text-embedding-3-small")
            .unwrap();
        assert!(embed.capabilities.contains(&"embeddings".to_string()));
    }

    #[tokio::test]
    async fn azure_auth_uses_api_key_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("api-key", "azure-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
            .mount(&server)
            .await;

        let adapter = OpenAICompatAdapter::api_key_header(server.uri(), "azure-key".into());
        let result = adapter
            .invoke(RequestKind::Chat, json!({ "model": "gpt-4o", "messages": [] }))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn get_costs_degrades_to_empty_when_endpoint_is_absent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let costs = adapter_for(&server)
            .get_costs(
                NaiveDate::from_ymd_opt(2026, 7, 1).unwrap(),
                NaiveDate::from_ymd_opt(2026, 7, 31).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(costs.total, 0.0);
        assert!(costs.daily_costs.is_empty());
    }
}
