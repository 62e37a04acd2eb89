//! AWS Bedrock adapter (Converse API).
//!
//! Talks to the Bedrock runtime's REST surface with bearer API-key auth and
//! translates between the OpenAI chat schema and Converse's message shape.
//! Streaming is not offered by this adapter: Converse streams use the binary
//! `vnd.amazon.eventstream` framing, so the routing engine skips Bedrock
//! candidates for `stream = true` requests.

use reqwest::{header, Client};
use serde_json::{json, Value};

use super::{
    pricing, CredentialInfo, InvokeError, ModelListing, RequestKind, CONNECT_TIMEOUT, READ_TIMEOUT,
};

/// Families advertised for catalog sync, matching the pricing table.
const CATALOG: &[&str] = &[
    "anthropic.claude-3-5-sonnet-20241022-v2:0",
    "anthropic.claude-3-5-haiku-20241022-v1:0",
    "meta.llama3-1-70b-instruct-v1:0",
    "meta.llama3-1-8b-instruct-v1:0",
    "amazon.titan-text-premier-v1:0",
    "mistral.mistral-large-2407-v1:0",
    "cohere.command-r-plus-v1:0",
];

#[derive(Debug)]
pub struct BedrockAdapter {
    client: Client,
    runtime_url: String,
    control_url: String,
}

impl BedrockAdapter {
    pub fn new(region: &str, api_key: String) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {api_key}"))
                .expect("Bedrock API key contains invalid header characters"),
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            runtime_url: format!("https://bedrock-runtime.{region}.amazonaws.com"),
            control_url: format!("https://bedrock.{region}.amazonaws.com"),
        }
    }

    /// Test seam: point both endpoints at one mock server.
    #[cfg(test)]
    fn with_urls(api_key: String, runtime_url: String, control_url: String) -> Self {
        let mut adapter = Self::new("us-east-1", api_key);
        adapter.runtime_url = runtime_url;
        adapter.control_url = control_url;
        adapter
    }

    pub async fn invoke(&self, kind: RequestKind, body: Value) -> Result<Value, InvokeError> {
        if kind == RequestKind::Embedding {
            return Err(InvokeError::Permanent {
                status: 400,
                message: "bedrock providers do not serve embeddings through the gateway".into(),
            });
        }

        let model_id = body["model"]
            .as_str()
            .ok_or_else(|| InvokeError::Permanent {
                status: 400,
                message: "`model` field is required".into(),
            })?
            .to_string();

        let converse_req = to_converse(&body)?;
        let url = format!("{}/model/{}/converse", self.runtime_url, model_id);
        let response = self
            .client
            .post(&url)
            .json(&converse_req)
            .send()
            .await
            .map_err(|e| InvokeError::Transient(format!("transport error: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| InvokeError::Transient(format!("reading response body: {e}")))?;
        if !status.is_success() {
            return Err(InvokeError::from_status(status.as_u16(), &text));
        }

        let converse_resp: Value =
            serde_json::from_str(&text).map_err(|e| InvokeError::Permanent {
                status: status.as_u16(),
                message: format!("upstream returned invalid JSON: {e}"),
            })?;
        from_converse(&model_id, converse_resp, kind)
    }

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
        Ok(CATALOG
            .iter()
            .map(|id| {
                let (input, output) = pricing::price_per_1m(id).unwrap_or((0.0, 0.0));
                ModelListing {
                    model_id: id.to_string(),
                    display_name: id.to_string(),
                    context_window: pricing::context_window(id).unwrap_or(0),
                    input_price_per_1m: input,
                    output_price_per_1m: output,
                    streaming_supported: false,
                    capabilities: vec!["chat".into(), "completion".into()],
                }
            })
            .collect())
    }

    /// `GET /foundation-models` on the control plane — cheap auth check.
    pub async fn probe(&self) -> Result<(), InvokeError> {
        let url = format!("{}/foundation-models", self.control_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| InvokeError::Transient(format!("transport error: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(InvokeError::from_status(status.as_u16(), &text));
        }
        Ok(())
    }
}

/// Convert an OpenAI chat request into a Converse request body.
///
/// The `prompt` form (legacy completions) is also accepted and wrapped as a
/// single user message, so both `/v1/*` endpoints route through here.
pub(crate) fn to_converse(request: &Value) -> Result<Value, InvokeError> {
    let mut system: Vec<Value> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    if let Some(raw) = request["messages"].as_array() {
        for msg in raw {
            let content = msg["content"].as_str().unwrap_or_default();
            match msg["role"].as_str() {
                Some("system") => system.push(json!({ "text": content })),
                Some(role) => messages.push(json!({
                    "role": if role == "assistant" { "assistant" } else { "user" },
                    "content": [{ "text": content }],
                })),
                None => {}
            }
        }
    } else if let Some(prompt) = request["prompt"].as_str() {
        messages.push(json!({ "role": "user", "content": [{ "text": prompt }] }));
    } else {
        return Err(InvokeError::Permanent {
            status: 400,
            message: "`messages` or `prompt` is required".into(),
        });
    }

    let mut inference = serde_json::Map::new();
    if let Some(max_tokens) = request["max_tokens"].as_u64() {
        inference.insert("maxTokens".into(), json!(max_tokens));
    }
    if let Some(temp) = request["temperature"].as_f64() {
        inference.insert("temperature".into(), json!(temp));
    }
    if let Some(top_p) = request["top_p"].as_f64() {
        inference.insert("topP".into(), json!(top_p));
    }
    if let Some(stop) = request.get("stop") {
        let sequences = match stop {
            Value::String(s) => json!([s]),
            other => other.clone(),
        };
        inference.insert("stopSequences".into(), sequences);
    }

    let mut req = json!({ "messages": messages });
    if !system.is_empty() {
        req["system"] = json!(system);
    }
    if !inference.is_empty() {
        req["inferenceConfig"] = Value::Object(inference);
    }
    Ok(req)
}

/// Convert a Converse response into the OpenAI schema for the request kind.
pub(crate) fn from_converse(
    model_id: &str,
    resp: Value,
    kind: RequestKind,
) -> Result<Value, InvokeError> {
    let text = resp
        .pointer("/output/message/content")
        .and_then(Value::as_array)
        .and_then(|blocks| blocks.iter().find_map(|b| b["text"].as_str()))
        .ok_or_else(|| InvokeError::Permanent {
            status: 502,
            message: "no text content in Converse response".into(),
        })?
        .to_string();

    let finish_reason = match resp["stopReason"].as_str().unwrap_or("end_turn") {
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" => "length",
        other => other,
    };
    let input_tokens = resp["usage"]["inputTokens"].as_u64().unwrap_or(0);
    let output_tokens = resp["usage"]["outputTokens"].as_u64().unwrap_or(0);

    let choice = match kind {
        RequestKind::Completion => json!({ "index": 0, "text": text, "finish_reason": finish_reason }),
        _ => json!({
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": finish_reason,
        }),
    };

    Ok(json!({
        "id": format!("bedrock-{}", uuid::Uuid::new_v4()),
        "object": if kind == RequestKind::Completion { "text_completion" } else { "chat.completion" },
        "created": 0,
        "model": model_id,
        "choices": [choice],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn to_converse_splits_system_and_conversation() {
        let req = json!({
            "model": "anthropic.claude-3-5-sonnet-20241022-v2:0",
            "messages": [
                { "role": "system", "content": "Be terse." },
                { "role": "user", "content": "Hi" },
                { "role": "assistant", "content": "Hello" },
            ],
            "max_tokens": 100,
            "temperature": 0.5,
        });
        let out = to_converse(&req).unwrap();
        assert_eq!(out["system"][0]["text"], "Be terse.");
        assert_eq!(out["messages"].as_array().unwrap().len(), 2);
        assert_eq!(out["inferenceConfig"]["maxTokens"], 100);
    }

    #[test]
    fn to_converse_accepts_prompt_form() {
        let req = json!({ "model": "meta.llama3-1-8b-instruct-v1:0", "prompt": "Say hi" });
        let out = to_converse(&req).unwrap();
        assert_eq!(out["messages"][0]["content"][0]["text"], "Say hi");
    }

    #[test]
    fn from_converse_maps_usage_and_stop_reason() {
        let resp = json!({
            "output": { "message": { "role": "assistant", "content": [{ "text": "hi" }] } },
            "stopReason": "max_tokens",
            "usage": { "inputTokens": 10, "outputTokens": 20 },
        });
        let out = from_converse("meta.llama3-1-8b-instruct-v1:0", resp, RequestKind::Chat).unwrap();
        assert_eq!(out["choices"][0]["finish_reason"], "length");
        assert_eq!(out["usage"]["prompt_tokens"], 10);
        assert_eq!(out["usage"]["completion_tokens"], 20);
        assert_eq!(out["choices"][0]["message"]["content"], "hi");
    }

    #[tokio::test]
    async fn invoke_posts_to_model_converse_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/model/meta.llama3-1-8b-instruct-v1:0/converse"))
            .and(header("authorization", "Bearer bk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "output": { "message": { "content": [{ "text": "pong" }] } },
                "stopReason": "end_turn",
                "usage": { "inputTokens": 3, "outputTokens": 1 },
            })))
            .mount(&server)
            .await;

        let adapter =
            BedrockAdapter::with_urls("bk-test".into(), server.uri(), server.uri());
        let response = adapter
            .invoke(
                RequestKind::Chat,
                json!({
                    "model": "meta.llama3-1-8b-instruct-v1:0",
                    "messages": [{ "role": "user", "content": "ping" }],
                }),
            )
            .await
            .unwrap();
        assert_eq!(response["choices"][0]["message"]["content"], "pong");
    }

    #[tokio::test]
    async fn invoke_classifies_throttling_as_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("ThrottlingException"))
            .mount(&server)
            .await;

        let adapter = BedrockAdapter::with_urls("bk".into(), server.uri(), server.uri());
        let err = adapter
            .invoke(
                RequestKind::Chat,
                json!({ "model": "m", "messages": [{ "role": "user", "content": "x" }] }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::RateLimitedUpstream(_)));
    }

    #[tokio::test]
    async fn catalog_models_are_priced_and_non_streaming() {
        let listings = BedrockAdapter::with_urls("k".into(), "http://x".into(), "http://x".into())
            .list_models()
            .await
            .unwrap();
        assert!(!listings.is_empty());
        for listing in &listings {
            assert!(!listing.streaming_supported);
        }
        let sonnet = listings
            .iter()
            .find(|l| l.model_id.starts_with("anthropic.claude-3-5-sonnet"))
            .unwrap();
        assert_eq!(sonnet.input_price_per_1m, 3.00);
    }
}
