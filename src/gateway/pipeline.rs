//! The gateway request pipeline.
//!
//! One flow serves `/v1/chat/completions`, `/v1/completions`, and
//! `/v1/embeddings`; the endpoint only selects the request schema and the
//! adapter method. Steps, in order: validate → allow-list → gate → rate-limit
//! → route → invoke (with per-candidate retry and failover) → record →
//! respond. The whole invoke phase runs under the request deadline.
//!
//! Invocation state machine per candidate:
//!
//! ```text
//! PENDING → DISPATCHED → (SUCCESS | TRANSIENT → retried once | FAIL | CLIENT_ERROR)
//! SUCCESS ends the pipeline; TRANSIENT/FAIL advance to the next candidate;
//! CLIENT_ERROR surfaces immediately.
//! ```

use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures_util::StreamExt as _;
use serde_json::Value;

use crate::{
    db::models::{GatewayKey, NewGatewayRequest, Organization, RequestStatus},
    error::GatewayError,
    providers::{
        pricing, InvocationMetrics, InvokeError, ProviderClient, RequestKind, SseStream,
    },
    state::AppState,
};

use super::{auth, features, rate_limit, recorder::UsageRecord, routing};

/// Backoff before the single transient retry; the second entry is the cap
/// applied if the retry budget is ever raised.
const RETRY_DELAYS: [Duration; 2] = [Duration::from_millis(100), Duration::from_millis(500)];

/// Retries per candidate on transient errors.
const MAX_RETRIES: usize = 1;

/// Entry point for all three `/v1/*` proxy endpoints.
pub async fn execute(
    state: Arc<AppState>,
    key: Arc<GatewayKey>,
    kind: RequestKind,
    body: Value,
    request_id: String,
) -> Response {
    match run(&state, &key, kind, body, &request_id).await {
        Ok(response) => response,
        // Gateway callers are developers; /v1/* always exposes the real error.
        Err(err) => err.into_envelope(Some(&request_id), true),
    }
}

async fn run(
    state: &Arc<AppState>,
    key: &Arc<GatewayKey>,
    kind: RequestKind,
    mut body: Value,
    request_id: &str,
) -> Result<Response, GatewayError> {
    let model = validate_body(kind, &body)?;
    auth::ensure_model_allowed(key, &model)?;

    let org = features::load_org(&state.db, key.org_id).await?;
    features::require_feature(&org, features::Feature::Gateway)?;
    features::require_gateway_quota(&state.cache, &org).await?;

    // Rate limit after the gate so quota-exhausted orgs see 402, not 429.
    if let rate_limit::Decision::Rejected {
        retry_after_secs,
        window_start,
    } = rate_limit::check(&state.cache, key.id, key.rate_limit).await?
    {
        let mut record = UsageRecord::new(base_row(&org, key, &model, RequestStatus::RateLimited));
        record.rate_window_start = Some(window_start);
        state.recorder.record(record).await;
        return Err(GatewayError::RateLimited { retry_after_secs });
    }

    let stream = kind != RequestKind::Embedding
        && body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let plan = routing::plan(state, &org, key, &model, stream).await?;
    let clients = resolve_clients(state, &org, &plan.candidates).await?;

    tracing::debug!(
        strategy = plan.strategy.as_str(),
        candidates = clients.len(),
        model = %model,
        stream,
        "dispatching"
    );

    let deadline = Duration::from_secs(state.settings.request_deadline_secs);
    if stream {
        stream_chain(state, &org, key, kind, &mut body, &model, clients, deadline).await
    } else {
        buffered_chain(state, &org, key, kind, &mut body, &model, clients, deadline, request_id)
            .await
    }
}

/// Schema gate: the fields the pipeline itself depends on. Everything else
/// passes through verbatim to preserve wire compatibility.
fn validate_body(kind: RequestKind, body: &Value) -> Result<String, GatewayError> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::validation_field("`model` is required", "model"))?
        .to_string();
    match kind {
        RequestKind::Chat => {
            let messages = body
                .get("messages")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    GatewayError::validation_field("`messages` must be an array", "messages")
                })?;
            if messages.is_empty() {
                return Err(GatewayError::validation_field(
                    "`messages` must not be empty",
                    "messages",
                ));
            }
        }
        RequestKind::Completion => {
            if body.get("prompt").is_none() {
                return Err(GatewayError::validation_field(
                    "`prompt` is required",
                    "prompt",
                ));
            }
        }
        RequestKind::Embedding => {
            if body.get("input").is_none() {
                return Err(GatewayError::validation_field(
                    "`input` is required",
                    "input",
                ));
            }
        }
    }
    Ok(model)
}

/// A candidate with its constructed client, ready to attempt.
type Armed = (routing::Candidate, Arc<ProviderClient>);

/// Build (or fetch cached) clients for the planned candidates. Candidates
/// whose credentials cannot be decrypted or whose managed master key is
/// absent are skipped — the plan's remaining candidates still get their shot.
async fn resolve_clients(
    state: &Arc<AppState>,
    org: &Organization,
    candidates: &[routing::Candidate],
) -> Result<Vec<Armed>, GatewayError> {
    let mut armed = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let provider = match crate::db::providers::find(&state.db, org.id, candidate.provider_id)
            .await
            .map_err(|e| GatewayError::ServiceUnavailable(format!("provider lookup failed: {e}")))?
        {
            Some(p) => p,
            None => continue,
        };

        match state.provider_client(&provider) {
            Ok(client) => armed.push((candidate.clone(), client)),
            Err(e) => {
                // A broken candidate (missing master key, undecryptable
                // credentials) must not sink the whole chain.
                tracing::warn!(provider_id = %provider.id, error = %e, "client construction failed — skipping candidate");
            }
        }
    }
    if armed.is_empty() {
        return Err(GatewayError::UpstreamFailed(
            "no usable provider candidates for this request".into(),
        ));
    }
    Ok(armed)
}

// ──────────────────────────────────────────────────────────────────────────────
// Buffered path
// ──────────────────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn buffered_chain(
    state: &Arc<AppState>,
    org: &Organization,
    key: &Arc<GatewayKey>,
    kind: RequestKind,
    body: &mut Value,
    model: &str,
    clients: Vec<Armed>,
    deadline: Duration,
    _request_id: &str,
) -> Result<Response, GatewayError> {
    let attempt = attempt_candidates(kind, body, &clients);
    let outcome = match tokio::time::timeout(deadline, attempt).await {
        Ok(outcome) => outcome,
        Err(_elapsed) => {
            let mut row = base_row(org, key, model, RequestStatus::Error);
            row.error_message = Some("gateway deadline exceeded".into());
            state.recorder.record(UsageRecord::new(row)).await;
            return Err(GatewayError::Timeout);
        }
    };

    match outcome {
        Ok((winner_idx, response, latency_ms)) => {
            let (candidate, _) = &clients[winner_idx];
            let metrics = InvocationMetrics::from_response(&candidate.model_id, body, &response);
            if !metrics.price_known {
                tracing::warn!(model = %metrics.model_id, "no pricing entry — cost recorded as 0");
            }
            routing::observe_latency(
                &state.cache,
                &candidate.provider_type,
                &candidate.model_id,
                latency_ms,
            )
            .await;

            let mut row = base_row(org, key, model, RequestStatus::Success);
            row.model_used = Some(metrics.model_id.clone());
            row.provider = Some(candidate.provider_type.clone());
            row.input_tokens = metrics.input_tokens as i32;
            row.output_tokens = metrics.output_tokens as i32;
            row.cost = metrics.estimated_cost;
            row.latency_ms = latency_ms as i32;
            row.is_managed = candidate.is_managed;
            if candidate.is_managed {
                row.marked_up_cost = Some(pricing::marked_up_cost(metrics.estimated_cost));
            }
            let mut record = UsageRecord::new(row);
            if candidate.is_managed {
                record.managed_provider_id = Some(candidate.provider_id);
            }
            state.recorder.record(record).await;

            Ok((StatusCode::OK, Json(response)).into_response())
        }
        Err(err) => {
            let gateway_err = err.into_gateway_error();
            let mut row = base_row(org, key, model, RequestStatus::Error);
            row.error_message = Some(gateway_err.to_string());
            state.recorder.record(UsageRecord::new(row)).await;
            Err(gateway_err)
        }
    }
}

/// Try each armed candidate in order. Transient failures are retried once on
/// the same candidate with backoff; client-origin errors surface immediately;
/// everything else advances the chain. Returns the winning index, the
/// upstream response, and the observed latency.
pub(crate) async fn attempt_candidates(
    kind: RequestKind,
    body: &mut Value,
    clients: &[Armed],
) -> Result<(usize, Value, u64), InvokeError> {
    let mut last_error = None;

    for (idx, (candidate, client)) in clients.iter().enumerate() {
        rewrite_body(body, &candidate.model_id, false);

        let mut attempts = 0;
        loop {
            let started = std::time::Instant::now();
            match client.invoke(kind, body.clone()).await {
                Ok(response) => {
                    return Ok((idx, response, started.elapsed().as_millis() as u64));
                }
                Err(err) if err.client_origin() => return Err(err),
                Err(err) if err.retryable() && attempts < MAX_RETRIES => {
                    let delay = RETRY_DELAYS[attempts.min(RETRY_DELAYS.len() - 1)];
                    tracing::debug!(
                        provider = %candidate.provider_type,
                        model = %candidate.model_id,
                        error = %err,
                        "transient failure — retrying after {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    attempts += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        provider = %candidate.provider_type,
                        model = %candidate.model_id,
                        error = %err,
                        "candidate failed — advancing"
                    );
                    last_error = Some(err);
                    break;
                }
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| InvokeError::Transient("no candidates were attempted".into())))
}

// ──────────────────────────────────────────────────────────────────────────────
// Streaming path
// ──────────────────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn stream_chain(
    state: &Arc<AppState>,
    org: &Organization,
    key: &Arc<GatewayKey>,
    kind: RequestKind,
    body: &mut Value,
    model: &str,
    clients: Vec<Armed>,
    deadline: Duration,
) -> Result<Response, GatewayError> {
    let mut last_error = None;

    for (candidate, client) in &clients {
        // The plan already drops non-streaming provider types; this guards
        // adapters that refuse streaming for other reasons.
        if !client.supports_streaming() {
            continue;
        }
        rewrite_body(body, &candidate.model_id, true);

        let mut attempts = 0;
        let upstream = loop {
            match tokio::time::timeout(deadline, client.invoke_stream(kind, body.clone())).await {
                Err(_elapsed) => {
                    let mut row = base_row(org, key, model, RequestStatus::Error);
                    row.error_message = Some("gateway deadline exceeded".into());
                    state.recorder.record(UsageRecord::new(row)).await;
                    return Err(GatewayError::Timeout);
                }
                Ok(Ok(stream)) => break Some(stream),
                Ok(Err(err)) if err.client_origin() => return Err(err.into_gateway_error()),
                Ok(Err(err)) if err.retryable() && attempts < MAX_RETRIES => {
                    tokio::time::sleep(RETRY_DELAYS[attempts.min(RETRY_DELAYS.len() - 1)]).await;
                    attempts += 1;
                }
                Ok(Err(err)) => {
                    tracing::warn!(
                        provider = %candidate.provider_type,
                        error = %err,
                        "streaming candidate failed — advancing"
                    );
                    last_error = Some(err);
                    break None;
                }
            }
        };

        if let Some(upstream) = upstream {
            // Once bytes flow, failover is over; the monitor records the row
            // when the stream completes (or the client disconnects).
            let monitored = monitor_stream(
                upstream,
                StreamContext {
                    state: Arc::clone(state),
                    row: base_row(org, key, model, RequestStatus::Success),
                    candidate: candidate.clone(),
                    request_body: body.clone(),
                },
            );
            let response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::from_stream(monitored))
                .expect("statically valid response");
            return Ok(response);
        }
    }

    let err = last_error
        .map(InvokeError::into_gateway_error)
        .unwrap_or_else(|| GatewayError::UpstreamFailed("no streaming-capable candidates".into()));
    let mut row = base_row(org, key, model, RequestStatus::Error);
    row.error_message = Some(err.to_string());
    state.recorder.record(UsageRecord::new(row)).await;
    Err(err)
}

struct StreamContext {
    state: Arc<AppState>,
    row: NewGatewayRequest,
    candidate: routing::Candidate,
    request_body: Value,
}

/// Proxy the upstream SSE bytes verbatim while watching the frames for the
/// final `usage` object. Latency is measured first byte → last byte; the
/// usage row is recorded when the stream ends, whatever ended it.
fn monitor_stream(
    upstream: SseStream,
    ctx: StreamContext,
) -> impl futures_util::Stream<Item = anyhow::Result<Bytes>> + Send {
    async_stream::stream! {
        let mut upstream = upstream;
        let mut first_byte_at: Option<std::time::Instant> = None;
        let mut last_byte_at: Option<std::time::Instant> = None;
        let mut line_buffer = String::new();
        let mut usage: Option<(u64, u64)> = None;
        let mut failed = false;

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    let now = std::time::Instant::now();
                    first_byte_at.get_or_insert(now);
                    last_byte_at = Some(now);

                    // Coalesce usage out of complete `data:` lines.
                    line_buffer.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(newline) = line_buffer.find('\n') {
                        let line = line_buffer[..newline].trim_end_matches('\r').to_string();
                        line_buffer.drain(..=newline);
                        if let Some(frame) = line.strip_prefix("data: ") {
                            if frame == "[DONE]" {
                                continue;
                            }
                            if let Ok(json) = serde_json::from_str::<Value>(frame) {
                                if let Some(u) = json.get("usage") {
                                    let input = u.get("prompt_tokens").and_then(Value::as_u64);
                                    let output = u.get("completion_tokens").and_then(Value::as_u64);
                                    if let (Some(input), Some(output)) = (input, output) {
                                        usage = Some((input, output));
                                    }
                                }
                            }
                        }
                    }

                    yield Ok(bytes);
                }
                Err(e) => {
                    failed = true;
                    yield Err(e);
                    break;
                }
            }
        }

        // Record best-effort, even on disconnect or upstream failure.
        let latency_ms = match (first_byte_at, last_byte_at) {
            (Some(first), Some(last)) => last.duration_since(first).as_millis() as u64,
            _ => 0,
        };
        let (input_tokens, output_tokens) = usage.unwrap_or_else(|| {
            (
                crate::providers::estimate_tokens(
                    &ctx.request_body
                        .get("messages")
                        .map(|m| m.to_string())
                        .unwrap_or_default(),
                ),
                0,
            )
        });
        let metrics =
            InvocationMetrics::from_counts(&ctx.candidate.model_id, input_tokens, output_tokens);

        routing::observe_latency(
            &ctx.state.cache,
            &ctx.candidate.provider_type,
            &ctx.candidate.model_id,
            latency_ms,
        )
        .await;

        if !metrics.price_known {
            tracing::warn!(model = %metrics.model_id, "no pricing entry — cost recorded as 0");
        }

        let mut row = ctx.row;
        row.status = if failed { RequestStatus::Error } else { RequestStatus::Success };
        row.model_used = Some(metrics.model_id.clone());
        row.provider = Some(ctx.candidate.provider_type.clone());
        row.input_tokens = metrics.input_tokens as i32;
        row.output_tokens = metrics.output_tokens as i32;
        row.cost = metrics.estimated_cost;
        row.latency_ms = latency_ms as i32;
        row.is_managed = ctx.candidate.is_managed;
        if ctx.candidate.is_managed {
            row.marked_up_cost = Some(pricing::marked_up_cost(metrics.estimated_cost));
        }
        let mut record = UsageRecord::new(row);
        if ctx.candidate.is_managed {
            record.managed_provider_id = Some(ctx.candidate.provider_id);
        }
        ctx.state.recorder.record(record).await;
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Helpers
// ──────────────────────────────────────────────────────────────────────────────

/// Rewrite `model` and `stream` in place before forwarding — same body
/// object, no copy of the payload.
fn rewrite_body(body: &mut Value, model_id: &str, stream: bool) {
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".into(), Value::String(model_id.to_string()));
        if stream {
            obj.insert("stream".into(), Value::Bool(true));
        } else {
            obj.remove("stream");
        }
    }
}

fn base_row(
    org: &Organization,
    key: &GatewayKey,
    model: &str,
    status: RequestStatus,
) -> NewGatewayRequest {
    NewGatewayRequest {
        org_id: org.id,
        user_id: None,
        team_id: key.team_id.clone(),
        key_id: Some(key.id),
        model_requested: model.to_string(),
        model_used: None,
        provider: None,
        input_tokens: 0,
        output_tokens: 0,
        cost: 0.0,
        marked_up_cost: None,
        latency_ms: 0,
        status,
        error_message: None,
        is_managed: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // -----------------------------------------------------------------------
    // Body validation
    // -----------------------------------------------------------------------

    #[test]
    fn chat_requires_model_and_nonempty_messages() {
        assert!(validate_body(RequestKind::Chat, &json!({ "messages": [] })).is_err());
        assert!(validate_body(RequestKind::Chat, &json!({ "model": "m" })).is_err());
        assert!(validate_body(RequestKind::Chat, &json!({ "model": "m", "messages": [] })).is_err());
        let ok = validate_body(
            RequestKind::Chat,
            &json!({ "model": "gpt-4o", "messages": [{ "role": "user", "content": "hi" }] }),
        )
        .unwrap();
        assert_eq!(ok, "gpt-4o");
    }

    #[test]
    fn completion_requires_prompt_and_embedding_requires_input() {
        assert!(validate_body(RequestKind::Completion, &json!({ "model": "m" })).is_err());
        assert!(
            validate_body(RequestKind::Completion, &json!({ "model": "m", "prompt": "x" })).is_ok()
        );
        assert!(validate_body(RequestKind::Embedding, &json!({ "model": "m" })).is_err());
        assert!(
            validate_body(RequestKind::Embedding, &json!({ "model": "m", "input": "x" })).is_ok()
        );
    }

    #[test]
    fn rewrite_body_swaps_model_and_strips_stream_for_buffered() {
        let mut body = json!({ "model": "requested", "stream": true, "messages": [] });
        rewrite_body(&mut body, "actual-model", false);
        assert_eq!(body["model"], "actual-model");
        assert!(body.get("stream").is_none());
        rewrite_body(&mut body, "actual-model", true);
        assert_eq!(body["stream"], true);
    }

    // -----------------------------------------------------------------------
    // Candidate chain — wiremock-backed
    // -----------------------------------------------------------------------

    fn armed_for(server: &MockServer, ptype: &str, model: &str) -> Armed {
        let candidate = routing::Candidate {
            provider_id: uuid::Uuid::new_v4(),
            provider_type: ptype.into(),
            model_id: model.into(),
            region: None,
            input_price: 1.0,
            output_price: 1.0,
            capabilities: vec!["chat".into()],
            is_managed: false,
            role: "primary".into(),
            weight: None,
        };
        let client = Arc::new(ProviderClient::OpenAICompat(
            crate::providers::OpenAICompatAdapter::bearer(server.uri(), "sk-test".into()),
        ));
        (candidate, client)
    }

    fn ok_body(content: &str) -> Value {
        json!({
            "choices": [{ "message": { "content": content }, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5 }
        })
    }

    #[tokio::test]
    async fn first_healthy_candidate_wins() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("hello")))
            .mount(&server)
            .await;

        let clients = vec![armed_for(&server, "openai", "gpt-4o")];
        let mut body = json!({ "model": "gpt-4o", "messages": [{ "role": "user", "content": "x" }] });
        let (idx, response, _latency) =
            attempt_candidates(RequestKind::Chat, &mut body, &clients)
                .await
                .unwrap();
        assert_eq!(idx, 0);
        assert_eq!(response.pointer("/choices/0/message/content").unwrap(), "hello");
    }

    #[tokio::test]
    async fn transient_then_permanent_advances_to_next_candidate() {
        // First candidate: one 503 (transient, retried), then 402 (permanent,
        // non-client) — two attempts total, then the chain advances.
        let failing = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&failing)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(402).set_body_string("billing hold"))
            .expect(1)
            .mount(&failing)
            .await;

        let healthy = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("fallback answer")))
            .expect(1)
            .mount(&healthy)
            .await;

        let clients = vec![
            armed_for(&failing, "azure", "gpt-4o"),
            armed_for(&healthy, "aws", "claude-3-5-sonnet"),
        ];
        let mut body = json!({ "model": "gpt-4o", "messages": [{ "role": "user", "content": "x" }] });
        let (idx, _response, _latency) =
            attempt_candidates(RequestKind::Chat, &mut body, &clients)
                .await
                .unwrap();
        assert_eq!(idx, 1, "the second candidate must serve the request");
        // The winning candidate saw the rewritten model.
        assert_eq!(body["model"], "claude-3-5-sonnet");
    }

    #[tokio::test]
    async fn client_origin_error_short_circuits_the_chain() {
        let bad_request = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid temperature"))
            .mount(&bad_request)
            .await;

        let never_called = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("should not run")))
            .expect(0)
            .mount(&never_called)
            .await;

        let clients = vec![
            armed_for(&bad_request, "openai", "gpt-4o"),
            armed_for(&never_called, "aws", "claude-3-5-sonnet"),
        ];
        let mut body = json!({ "model": "gpt-4o", "messages": [{ "role": "user", "content": "x" }] });
        let err = attempt_candidates(RequestKind::Chat, &mut body, &clients)
            .await
            .unwrap_err();
        assert!(err.client_origin());
    }

    #[tokio::test]
    async fn exhausted_chain_returns_last_error() {
        let down = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&down)
            .await;

        let clients = vec![armed_for(&down, "openai", "gpt-4o")];
        let mut body = json!({ "model": "gpt-4o", "messages": [{ "role": "user", "content": "x" }] });
        let err = attempt_candidates(RequestKind::Chat, &mut body, &clients)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Transient(_)));
    }
}
