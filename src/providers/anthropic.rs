//! Anthropic Messages API adapter.
//!
//! Translates between the OpenAI schema (the gateway's wire format) and
//! Anthropic's `/v1/messages` API, both buffered and streaming. Callers route
//! requests as normal OpenAI-format JSON; this adapter handles the schema
//! differences transparently.
//!
//! # Protocol differences handled here
//!
//! | Concern | OpenAI | Anthropic |
//! |---|---|---|
//! | System prompt | First message with `role: "system"` | Top-level `system` field |
//! | Max tokens | Optional (`max_tokens`) | **Required** (`max_tokens`) |
//! | Finish reasons | `"stop"`, `"length"` | `"end_turn"`, `"max_tokens"` |
//! | Response shape | `choices[].message.content` | `content[].text` |
//! | Streaming | one chunk schema | typed SSE events |
//! | Auth header | `Authorization: Bearer …` | `x-api-key: …` |

use bytes::Bytes;
use futures_util::StreamExt as _;
use reqwest::{header, Client};
use serde_json::{json, Value};

use super::{
    pricing, CredentialInfo, InvokeError, ModelListing, RequestKind, SseStream, CONNECT_TIMEOUT,
    READ_TIMEOUT, STREAM_TIMEOUT,
};

/// Default max_tokens when the caller omits it. Required by Anthropic;
/// sensible ceiling for most conversational use-cases.
const DEFAULT_MAX_TOKENS: u64 = 8_192;

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Model families advertised for catalog sync. Anthropic has no public
/// listing endpoint usable with scoped keys, so the catalog is static.
const CATALOG: &[&str] = &[
    "claude-3-5-sonnet-20241022",
    "claude-3-5-haiku-20241022",
    "claude-3-opus-20240229",
    "claude-3-haiku-20240307",
];

#[derive(Debug)]
pub struct AnthropicAdapter {
    client: Client,
    stream_client: Client,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(base_url: String, api_key: String) -> Self {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            "x-api-key",
            header::HeaderValue::from_str(&api_key)
                .expect("Anthropic API key contains invalid header characters"),
        );
        headers.insert(
            "anthropic-version",
            header::HeaderValue::from_static(ANTHROPIC_VERSION),
        );

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

    /// Translate and forward one buffered request, then translate the
    /// response back to the OpenAI schema for the request kind.
    pub async fn invoke(&self, kind: RequestKind, body: Value) -> Result<Value, InvokeError> {
        let body = match kind {
            RequestKind::Chat => body,
            RequestKind::Completion => completion_to_chat(body)?,
            RequestKind::Embedding => {
                return Err(InvokeError::Permanent {
                    status: 400,
                    message: "anthropic providers do not serve embeddings".into(),
                })
            }
        };

        let anthropic_req = to_anthropic(body)?;
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&anthropic_req)
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

        let body: Value = serde_json::from_str(&text).map_err(|e| InvokeError::Permanent {
            status: status.as_u16(),
            message: format!("upstream returned invalid JSON: {e}"),
        })?;

        let openai = from_anthropic(body)?;
        Ok(match kind {
            RequestKind::Completion => chat_response_to_completion(openai),
            _ => openai,
        })
    }

    /// Streaming: forward to `/v1/messages` with `stream: true` and translate
    /// Anthropic's typed SSE events into OpenAI chat-completion chunks ending
    /// with `data: [DONE]`.
    pub async fn invoke_stream(
        &self,
        kind: RequestKind,
        body: Value,
    ) -> Result<SseStream, InvokeError> {
        if kind == RequestKind::Embedding {
            return Err(InvokeError::Permanent {
                status: 400,
                message: "anthropic providers do not serve embeddings".into(),
            });
        }
        let body = match kind {
            RequestKind::Completion => completion_to_chat(body)?,
            _ => body,
        };
        let mut anthropic_req = to_anthropic(body)?;
        anthropic_req["stream"] = Value::Bool(true);

        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .stream_client
            .post(&url)
            .json(&anthropic_req)
            .send()
            .await
            .map_err(|e| InvokeError::Transient(format!("transport error: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(InvokeError::from_status(status.as_u16(), &text));
        }

        Ok(translate_stream(response.bytes_stream()))
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
                    context_window: pricing::context_window(id).unwrap_or(200_000),
                    input_price_per_1m: input,
                    output_price_per_1m: output,
                    streaming_supported: true,
                    capabilities: vec!["chat".into(), "completion".into()],
                }
            })
            .collect())
    }

    /// Probe with a minimal 1-token request. Anthropic exposes no listing
    /// endpoint for scoped keys, so a cheap inference call is the reliable
    /// way to verify auth + connectivity.
    pub async fn probe(&self) -> Result<(), InvokeError> {
        let probe = json!({
            "model": "claude-3-5-haiku-20241022",
            "max_tokens": 1,
            "messages": [{ "role": "user", "content": "ping" }],
        });
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&probe)
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

// ──────────────────────────────────────────────────────────────────────────────
// Schema translation — pub(crate) for unit testing
// ──────────────────────────────────────────────────────────────────────────────

/// Convert an OpenAI chat completions request to the Anthropic Messages format.
pub(crate) fn to_anthropic(request: Value) -> Result<Value, InvokeError> {
    let model = request["model"]
        .as_str()
        .ok_or_else(|| bad_request("`model` field is required"))?
        .to_string();

    let max_tokens = request["max_tokens"].as_u64().unwrap_or(DEFAULT_MAX_TOKENS);

    let raw_messages = request["messages"]
        .as_array()
        .ok_or_else(|| bad_request("`messages` array is required"))?;

    // Anthropic treats system content as a top-level field, not a message
    // role. Multiple system messages are concatenated.
    let mut system_parts: Vec<&str> = Vec::new();
    let mut messages: Vec<Value> = Vec::with_capacity(raw_messages.len());
    for msg in raw_messages {
        if msg["role"].as_str() == Some("system") {
            if let Some(content) = msg["content"].as_str() {
                system_parts.push(content);
            }
        } else {
            messages.push(msg.clone());
        }
    }

    let mut req = json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": messages,
    });
    if !system_parts.is_empty() {
        req["system"] = Value::String(system_parts.join("\n\n"));
    }
    if let Some(temp) = request["temperature"].as_f64() {
        req["temperature"] = json!(temp);
    }
    if let Some(top_p) = request["top_p"].as_f64() {
        req["top_p"] = json!(top_p);
    }
    if let Some(stop) = request.get("stop") {
        req["stop_sequences"] = match stop {
            Value::String(s) => json!([s]),
            other => other.clone(),
        };
    }
    Ok(req)
}

/// Convert an Anthropic Messages response to the OpenAI chat completions schema.
pub(crate) fn from_anthropic(resp: Value) -> Result<Value, InvokeError> {
    let text = resp["content"]
        .as_array()
        .and_then(|blocks| blocks.iter().find(|b| b["type"] == "text"))
        .and_then(|b| b["text"].as_str())
        .ok_or_else(|| InvokeError::Permanent {
            status: 502,
            message: "no text block in Anthropic response `content` array".into(),
        })?
        .to_string();

    let model = resp["model"].as_str().unwrap_or("unknown");
    let finish_reason = map_stop_reason(resp["stop_reason"].as_str().unwrap_or("stop"));
    let input_tokens = resp["usage"]["input_tokens"].as_u64().unwrap_or(0);
    let output_tokens = resp["usage"]["output_tokens"].as_u64().unwrap_or(0);

    Ok(json!({
        "id": resp["id"],
        "object": "chat.completion",
        "created": 0,
        "model": model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": text },
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
        },
    }))
}

fn map_stop_reason(reason: &str) -> &str {
    match reason {
        "end_turn" | "stop_sequence" => "stop",
        "max_tokens" => "length",
        other => other,
    }
}

/// Wrap a legacy completions request as a single-user-message chat request.
fn completion_to_chat(request: Value) -> Result<Value, InvokeError> {
    let prompt = match request.get("prompt") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("\n"),
        _ => return Err(bad_request("`prompt` field is required")),
    };
    let mut chat = request;
    if let Some(obj) = chat.as_object_mut() {
        obj.remove("prompt");
        obj.insert(
            "messages".into(),
            json!([{ "role": "user", "content": prompt }]),
        );
    }
    Ok(chat)
}

/// Re-shape a chat response into the legacy completions schema.
fn chat_response_to_completion(mut response: Value) -> Value {
    let text = response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let finish_reason = response
        .pointer("/choices/0/finish_reason")
        .cloned()
        .unwrap_or(Value::Null);
    response["object"] = json!("text_completion");
    response["choices"] = json!([{ "index": 0, "text": text, "finish_reason": finish_reason }]);
    response
}

fn bad_request(message: &str) -> InvokeError {
    InvokeError::Permanent {
        status: 400,
        message: message.to_string(),
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Streaming translation
// ──────────────────────────────────────────────────────────────────────────────

/// Translate Anthropic's typed SSE events into OpenAI chat-completion chunks.
///
/// Event mapping:
/// - `message_start` → role chunk (captures `usage.input_tokens` and message id)
/// - `content_block_delta` / `text_delta` → content chunk
/// - `message_delta` → finish chunk carrying `finish_reason` and full `usage`
/// - `message_stop` → `data: [DONE]`
fn translate_stream(
    upstream: impl futures_util::Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
) -> SseStream {
    let stream = async_stream::stream! {
        futures_util::pin_mut!(upstream);
        let mut buffer = String::new();
        let mut message_id = String::from("chatcmpl-unknown");
        let mut model = String::from("unknown");
        let mut input_tokens: u64 = 0;
        let mut output_tokens: u64 = 0;
        let mut finish_reason = String::from("stop");

        while let Some(chunk) = upstream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    yield Err(anyhow::Error::from(e));
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // Consume complete lines; a partial line stays buffered.
            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim_end_matches('\r').to_string();
                buffer.drain(..=newline);

                let Some(data) = line.strip_prefix("data: ") else { continue };
                let Ok(event) = serde_json::from_str::<Value>(data) else { continue };

                match event["type"].as_str() {
                    Some("message_start") => {
                        if let Some(id) = event.pointer("/message/id").and_then(Value::as_str) {
                            message_id = id.to_string();
                        }
                        if let Some(m) = event.pointer("/message/model").and_then(Value::as_str) {
                            model = m.to_string();
                        }
                        input_tokens = event
                            .pointer("/message/usage/input_tokens")
                            .and_then(Value::as_u64)
                            .unwrap_or(0);
                        yield Ok(chunk_frame(&message_id, &model, json!({ "role": "assistant" }), None, None));
                    }
                    Some("content_block_delta") => {
                        if let Some(text) = event.pointer("/delta/text").and_then(Value::as_str) {
                            yield Ok(chunk_frame(&message_id, &model, json!({ "content": text }), None, None));
                        }
                    }
                    Some("message_delta") => {
                        if let Some(reason) = event.pointer("/delta/stop_reason").and_then(Value::as_str) {
                            finish_reason = map_stop_reason(reason).to_string();
                        }
                        output_tokens = event
                            .pointer("/usage/output_tokens")
                            .and_then(Value::as_u64)
                            .unwrap_or(output_tokens);
                    }
                    Some("message_stop") => {
                        let usage = json!({
                            "prompt_tokens": input_tokens,
                            "completion_tokens": output_tokens,
                            "total_tokens": input_tokens + output_tokens,
                        });
                        yield Ok(chunk_frame(&message_id, &model, json!({}), Some(&finish_reason), Some(usage)));
                        yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));
                    }
                    _ => {}
                }
            }
        }
    };
    Box::pin(stream)
}

fn chunk_frame(
    id: &str,
    model: &str,
    delta: Value,
    finish_reason: Option<&str>,
    usage: Option<Value>,
) -> Bytes {
    let mut frame = json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": 0,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    });
    if let Some(usage) = usage {
        frame["usage"] = usage;
    }
    Bytes::from(format!("data: {frame}\n\n"))
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── to_anthropic ──────────────────────────────────────────────────────────

    #[test]
    fn to_anthropic_extracts_system_message_to_top_level() {
        let req = json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [
                { "role": "system", "content": "You are a helpful assistant." },
                { "role": "user",   "content": "Hello" },
            ],
        });
        let out = to_anthropic(req).unwrap();
        assert_eq!(out["system"], "You are a helpful assistant.");
        let messages = out["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1, "system message should leave the messages array");
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn to_anthropic_concatenates_multiple_system_messages() {
        let req = json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [
                { "role": "system", "content": "Part one." },
                { "role": "system", "content": "Part two." },
                { "role": "user",   "content": "Hello" },
            ],
        });
        let out = to_anthropic(req).unwrap();
        assert_eq!(out["system"], "Part one.\n\nPart two.");
    }

    #[test]
    fn to_anthropic_defaults_max_tokens_when_absent() {
        let req = json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{ "role": "user", "content": "Hi" }],
        });
        let out = to_anthropic(req).unwrap();
        assert_eq!(out["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn to_anthropic_wraps_string_stop_into_sequence_array() {
        let req = json!({
            "model": "claude-3-5-sonnet-20241022",
            "messages": [{ "role": "user", "content": "Hi" }],
            "stop": "END",
        });
        let out = to_anthropic(req).unwrap();
        assert_eq!(out["stop_sequences"], json!(["END"]));
    }

    #[test]
    fn to_anthropic_errors_without_model_or_messages() {
        assert!(to_anthropic(json!({ "messages": [] })).is_err());
        assert!(to_anthropic(json!({ "model": "claude-3-5-sonnet-20241022" })).is_err());
    }

    // ── from_anthropic ────────────────────────────────────────────────────────

    #[test]
    fn from_anthropic_maps_end_turn_to_stop() {
        let resp = json!({
            "id": "msg_123",
            "model": "claude-3-5-sonnet-20241022",
            "content": [{ "type": "text", "text": "Hello!" }],
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 10, "output_tokens": 5 },
        });
        let out = from_anthropic(resp).unwrap();
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
        assert_eq!(out["choices"][0]["message"]["content"], "Hello!");
        assert_eq!(out["usage"]["prompt_tokens"], 10);
        assert_eq!(out["usage"]["total_tokens"], 15);
    }

    #[test]
    fn from_anthropic_maps_max_tokens_stop_reason_to_length() {
        let resp = json!({
            "id": "msg_456",
            "model": "claude-3-5-sonnet-20241022",
            "content": [{ "type": "text", "text": "…" }],
            "stop_reason": "max_tokens",
            "usage": { "input_tokens": 100, "output_tokens": 1024 },
        });
        let out = from_anthropic(resp).unwrap();
        assert_eq!(out["choices"][0]["finish_reason"], "length");
    }

    #[test]
    fn from_anthropic_errors_when_no_text_block_present() {
        let resp = json!({
            "id": "msg_789",
            "model": "claude-3-5-sonnet-20241022",
            "content": [{ "type": "tool_use", "id": "toolu_1", "name": "calc", "input": {} }],
            "stop_reason": "tool_use",
            "usage": { "input_tokens": 10, "output_tokens": 5 },
        });
        assert!(from_anthropic(resp).is_err());
    }

    // ── completions wrapping ──────────────────────────────────────────────────

    #[test]
    fn completion_request_wraps_prompt_as_user_message() {
        let req = json!({ "model": "claude-3-5-sonnet-20241022", "prompt": "Say hi" });
        let chat = completion_to_chat(req).unwrap();
        assert_eq!(chat["messages"][0]["role"], "user");
        assert_eq!(chat["messages"][0]["content"], "Say hi");
        assert!(chat.get("prompt").is_none());
    }

    #[test]
    fn completion_response_shape_carries_text_field() {
        let chat_resp = json!({
            "id": "msg_1",
            "object": "chat.completion",
            "choices": [{ "index": 0, "message": { "content": "hi there" }, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 2, "completion_tokens": 2, "total_tokens": 4 },
        });
        let out = chat_response_to_completion(chat_resp);
        assert_eq!(out["object"], "text_completion");
        assert_eq!(out["choices"][0]["text"], "hi there");
        assert_eq!(out["choices"][0]["finish_reason"], "stop");
    }

    // ── streaming translation ─────────────────────────────────────────────────

    #[tokio::test]
    async fn stream_translation_emits_openai_chunks_and_done() {
        let events = vec![
            r#"data: {"type":"message_start","message":{"id":"msg_s1","model":"claude-3-5-sonnet-20241022","usage":{"input_tokens":12}}}"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#,
            r#"data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":7}}"#,
            r#"data: {"type":"message_stop"}"#,
        ];
        let body = events.join("\n\n") + "\n\n";
        let upstream = futures_util::stream::iter(vec![Ok(Bytes::from(body))]);

        let mut translated = translate_stream(upstream);
        let mut frames = Vec::new();
        while let Some(frame) = translated.next().await {
            frames.push(String::from_utf8(frame.unwrap().to_vec()).unwrap());
        }

        // role chunk + 2 content chunks + finish chunk + [DONE]
        assert_eq!(frames.len(), 5);
        assert!(frames[0].contains("\"role\":\"assistant\""));
        assert!(frames[1].contains("Hel"));
        assert!(frames[2].contains("lo"));
        let finish: Value =
            serde_json::from_str(frames[3].trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(finish["choices"][0]["finish_reason"], "stop");
        assert_eq!(finish["usage"]["prompt_tokens"], 12);
        assert_eq!(finish["usage"]["completion_tokens"], 7);
        assert_eq!(frames[4], "data: [DONE]\n\n");
    }

    #[tokio::test]
    async fn stream_translation_handles_events_split_across_chunks() {
        let part1 = r#"data: {"type":"message_start","message":{"id":"m","model":"claude-3-5-haiku-20241022","usage":{"input_tokens":1}}}"#.to_string() + "\n\ndata: {\"type\":\"content_blo";
        let part2 = "ck_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"x\"}}\n\ndata: {\"type\":\"message_stop\"}\n\n";
        let upstream = futures_util::stream::iter(vec![
            Ok(Bytes::from(part1)),
            Ok(Bytes::from(part2.to_string())),
        ]);

        let mut translated = translate_stream(upstream);
        let mut count = 0;
        let mut saw_content = false;
        while let Some(frame) = translated.next().await {
            let text = String::from_utf8(frame.unwrap().to_vec()).unwrap();
            if text.contains("\"content\":\"x\"") {
                saw_content = true;
            }
            count += 1;
        }
        assert!(saw_content, "split event must still produce its content chunk");
        assert!(count >= 3);
    }

    // ── kind gating ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn embeddings_are_rejected_as_permanent() {
        let adapter = AnthropicAdapter::new("http://localhost:9".into(), "sk-test".into());
        let err = adapter
            .invoke(RequestKind::Embedding, json!({ "model": "claude", "input": "x" }))
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Permanent { status: 400, .. }));
    }
}
