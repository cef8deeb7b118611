//! Gateway pipeline - orchestrates one inbound request end to end
//!
//! For every request that is not an internal control route:
//!
//! 1. claude_code mode proxies the raw call to the legacy endpoint
//! 2. otherwise: key admission, body parsing, routing, request transcoding,
//!    the upstream call, and response transcoding (streaming or buffered)
//! 3. after the response stream closes - on success, error, or client
//!    disconnect - the interaction record is persisted, key usage is
//!    accounted (single transaction, status < 400 only), and a summary is
//!    broadcast to live subscribers
//!
//! The record write is best-effort: failures are logged and never surface
//! into the client path.

pub mod auth;
pub mod broadcast;
pub mod error;
pub mod passthrough;
pub mod server;
pub mod state;

pub use broadcast::RecordBroadcaster;
pub use error::GatewayError;
pub use state::GatewayState;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Method, Request, Response, Uri},
};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::convert::request::{
    build_upstream_payload, extract_last_user_message, ChatRequest,
};
use crate::convert::response::{convert_complete_response, extract_usage};
use crate::convert::stream::{StreamConverter, Usage};
use crate::convert::ChunkFlavor;
use crate::providers::{ProviderClient, UpstreamError};
use crate::routing::{RouteDecision, Router, RoutingMode, RoutingSnapshot};
use crate::store::{NewRecord, RecordSummary, UserKey};
use crate::tokens::estimate_input_tokens;
use crate::util::hash_api_key;

/// Buffer between the conversion task and the client connection
const SSE_CHANNEL_BUFFER: usize = 64;

/// Route prefixes reserved for the control plane; never proxied upstream
const INTERNAL_PREFIXES: [&str; 2] = ["/control/", "/_api/"];

fn is_internal_path(path: &str) -> bool {
    path == "/ws" || path == "/about" || INTERNAL_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Main gateway handler - every non-internal route lands here
pub async fn gateway_handler(
    State(state): State<GatewayState>,
    req: Request<Body>,
) -> Response<Body> {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let headers = req.headers().clone();

    tracing::debug!("Gateway request: {} {}", method, uri.path());

    // Internal paths that matched no control route are not client traffic;
    // they get a plain 404 and no interaction record
    if is_internal_path(uri.path()) {
        return Response::builder()
            .status(404)
            .header("Content-Type", "application/json")
            .body(Body::from(json!({"error": "Not found"}).to_string()))
            .unwrap_or_else(|_| Response::new(Body::empty()));
    }

    let body_bytes = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let record = base_record(&method, &uri, &headers, None);
            let err = GatewayError::BadRequest(format!("Failed to read request body: {}", e));
            return fail(&state, record, err, start).await;
        }
    };

    // Snapshots captured once; admin mutations mid-request do not affect us
    let snapshot = state.routing();
    let registry = state.providers();

    let mut record = base_record(&method, &uri, &headers, Some(&body_bytes));

    // 1. Legacy passthrough mode short-circuits everything else
    if snapshot.mode == RoutingMode::ClaudeCode {
        return handle_passthrough(&state, &snapshot, &method, &uri, &headers, body_bytes, record, start)
            .await;
    }

    // 2. Admission
    let user_key = match auth::admit(&state.store, &headers).await {
        Ok(key) => key,
        Err(err) => return fail(&state, record, err, start).await,
    };
    record.user_key_id = Some(user_key.id);

    if method != Method::POST {
        let err = GatewayError::BadRequest(format!(
            "Method {} is not supported in multi-platform mode, use POST",
            method
        ));
        return fail(&state, record, err, start).await;
    }

    // 3. Parse
    let chat_request: ChatRequest = match serde_json::from_slice(&body_bytes) {
        Ok(request) => request,
        Err(e) => {
            let err = GatewayError::BadRequest(format!("Request body is not valid JSON: {}", e));
            return fail(&state, record, err, start).await;
        }
    };

    // 4. Route
    let last_user_message = extract_last_user_message(&chat_request.messages);
    let decision = match Router::new(&snapshot, &registry)
        .route(&last_user_message)
        .await
    {
        Ok(decision) => decision,
        Err(e) => return fail(&state, record, GatewayError::Routing(e.to_string()), start).await,
    };

    let (platform, model_id, scene) = match decision {
        // The active config flipped to claude_code between mode check and
        // routing; treat it like passthrough mode
        RouteDecision::Passthrough => {
            return handle_passthrough(
                &state, &snapshot, &method, &uri, &headers, body_bytes, record, start,
            )
            .await;
        }
        RouteDecision::Dispatch {
            platform,
            model_id,
            scene,
        } => (platform, model_id, scene),
    };

    let Some(adapter) = registry.get(platform) else {
        let err = GatewayError::Routing(format!("Platform {} is not loaded", platform));
        return fail(&state, record, err, start).await;
    };

    // 5-6. Transcode and address the upstream
    let streaming = chat_request.is_streaming();
    let payload = build_upstream_payload(&chat_request, platform, &model_id, streaming);
    let estimated_input = payload
        .get("messages")
        .and_then(|m| m.as_array())
        .map(|messages| estimate_input_tokens(messages))
        .unwrap_or(0);

    record.target_platform = Some(platform.as_str().to_string());
    record.target_model = Some(model_id.clone());
    record.platform_base_url = Some(adapter.base_url());
    record.routing_scene = scene;
    record.processed_prompt = serde_json::to_string_pretty(&payload).ok();
    record.processed_headers = Some(processed_headers_json(adapter.as_ref()));

    tracing::info!(
        "Dispatching {} -> {}:{} (stream={})",
        chat_request.model,
        platform,
        model_id,
        streaming
    );

    // 7-9. Call, transcode the response, record, broadcast
    if streaming {
        handle_streaming(
            state,
            adapter,
            ChunkFlavor::for_platform(platform),
            payload,
            record,
            user_key,
            chat_request.model,
            estimated_input,
            start,
        )
        .await
    } else {
        handle_buffered(
            state,
            adapter,
            payload,
            record,
            user_key,
            chat_request.model,
            estimated_input,
            start,
        )
        .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Streaming path
// ─────────────────────────────────────────────────────────────────────────────

/// Issue the upstream call and pump converted SSE events to the client
///
/// The conversion loop runs in its own task. The deferred record write sits
/// after the loop and runs on every exit path: normal end, upstream error,
/// and client disconnect (detected as a failed channel send).
#[allow(clippy::too_many_arguments)]
async fn handle_streaming(
    state: GatewayState,
    adapter: Arc<dyn ProviderClient>,
    flavor: ChunkFlavor,
    payload: Value,
    mut record: NewRecord,
    user_key: UserKey,
    original_model: String,
    estimated_input: u64,
    start: Instant,
) -> Response<Body> {
    let (tx, rx) = mpsc::channel::<Result<Bytes, Infallible>>(SSE_CHANNEL_BUFFER);

    tokio::spawn(async move {
        let mut converter = StreamConverter::new(flavor, &original_model);
        converter.set_estimated_input_tokens(estimated_input);

        let mut emitted = String::new();
        let mut raw_chunks: Vec<String> = Vec::new();
        let mut status: u16 = 200;
        let mut client_gone = false;

        match adapter.chat_with_payload(&payload, true).await {
            Ok(exchange) => {
                record.model_raw_headers = Some(header_pairs_json(&exchange.headers));
                let mut upstream = exchange.stream;

                while let Some(item) = upstream.next().await {
                    match item {
                        Ok(line) => {
                            raw_chunks.push(line.clone());
                            let events = converter.convert_chunk(&line);
                            if events.is_empty() {
                                continue;
                            }
                            emitted.push_str(&events);
                            if !client_gone && tx.send(Ok(Bytes::from(events))).await.is_err() {
                                tracing::debug!("Client disconnected, cancelling upstream read");
                                client_gone = true;
                                break;
                            }
                        }
                        Err(e) => {
                            let err = upstream_error(&e);
                            status = err.status().as_u16();
                            let event = err.sse_event();
                            emitted.push_str(&event);
                            if !client_gone {
                                let _ = tx.send(Ok(Bytes::from(event))).await;
                            }
                            break;
                        }
                    }
                }

                if !converter.has_started() {
                    tracing::warn!("Upstream stream produced no usable chunks");
                }

                // Close the event grammar if the upstream never terminated it
                if !converter.has_ended() {
                    let tail = converter.finish();
                    if !tail.is_empty() {
                        emitted.push_str(&tail);
                        if !client_gone {
                            let _ = tx.send(Ok(Bytes::from(tail))).await;
                        }
                    }
                }
            }
            Err(e) => {
                let err = upstream_error(&e);
                status = err.status().as_u16();
                let event = err.sse_event();
                emitted.push_str(&event);
                record.model_raw_response = Some(err.body_json().to_string());
                let _ = tx.send(Ok(Bytes::from(event))).await;
            }
        }
        drop(tx);

        // Deferred record write: runs with whatever state accumulated
        let usage = converter.usage();
        record.response_status = status;
        record.response_body = Some(emitted);
        if record.model_raw_response.is_none() {
            record.model_raw_response = Some(raw_chunks.join("\n"));
        }
        finalize(&state, record, Some(user_key), start, Some(usage)).await;
    });

    sse_response(ReceiverStream::new(rx))
}

fn sse_response(stream: ReceiverStream<Result<Bytes, Infallible>>) -> Response<Body> {
    Response::builder()
        .status(200)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Buffered path
// ─────────────────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn handle_buffered(
    state: GatewayState,
    adapter: Arc<dyn ProviderClient>,
    payload: Value,
    mut record: NewRecord,
    user_key: UserKey,
    original_model: String,
    estimated_input: u64,
    start: Instant,
) -> Response<Body> {
    let exchange = match adapter.chat_with_payload(&payload, false).await {
        Ok(exchange) => exchange,
        Err(e) => {
            let err = upstream_error(&e);
            record.model_raw_response = Some(err.body_json().to_string());
            return fail(&state, record, err, start).await;
        }
    };
    record.model_raw_headers = Some(header_pairs_json(&exchange.headers));

    let mut upstream_body = String::new();
    let mut stream = exchange.stream;
    while let Some(item) = stream.next().await {
        match item {
            Ok(chunk) => upstream_body.push_str(&chunk),
            Err(e) => {
                let err = upstream_error(&e);
                record.model_raw_response = Some(upstream_body);
                return fail(&state, record, err, start).await;
            }
        }
    }

    let converted = convert_complete_response(&upstream_body, &original_model);

    // Upstream-reported counts win; the estimator fills the gaps
    let (reported_input, reported_output) = extract_usage(&upstream_body);
    let input_tokens = if reported_input > 0 {
        reported_input
    } else {
        estimated_input
    };
    let output_tokens = if reported_output > 0 {
        reported_output
    } else {
        serde_json::from_str::<Value>(&converted)
            .ok()
            .and_then(|document| {
                document["content"][0]["text"]
                    .as_str()
                    .map(crate::tokens::estimate_tokens)
            })
            .unwrap_or(0)
    };

    record.response_status = 200;
    record.model_raw_response = Some(upstream_body);
    record.response_body = Some(converted.clone());
    finalize(
        &state,
        record,
        Some(user_key),
        start,
        Some(Usage {
            input_tokens,
            output_tokens,
        }),
    )
    .await;

    Response::builder()
        .status(200)
        .header("Content-Type", "application/json")
        .body(Body::from(converted))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Passthrough path
// ─────────────────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn handle_passthrough(
    state: &GatewayState,
    snapshot: &RoutingSnapshot,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
    mut record: NewRecord,
    start: Instant,
) -> Response<Body> {
    record.target_platform = Some("DashScope".to_string());
    record.target_model = Some("claude-code-proxy".to_string());
    record.platform_base_url = Some(snapshot.passthrough.url.clone());

    match passthrough::forward(
        &state.passthrough_http,
        &snapshot.passthrough,
        method,
        uri.query(),
        headers,
        body,
    )
    .await
    {
        Ok(outcome) => {
            record.response_status = outcome.status;
            record.response_headers = Some(header_pairs_json(&outcome.headers));
            record.response_body = Some(String::from_utf8_lossy(&outcome.body).to_string());
            finalize(state, record, None, start, None).await;

            let mut builder = Response::builder().status(outcome.status);
            for (name, value) in &outcome.headers {
                builder = builder.header(name, value);
            }
            builder
                .body(Body::from(outcome.body))
                .unwrap_or_else(|_| Response::new(Body::empty()))
        }
        Err(err) => fail(state, record, err, start).await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Recording
// ─────────────────────────────────────────────────────────────────────────────

/// Persist the record, account key usage, broadcast the summary
///
/// Usage is appended (one transaction with the `used_tokens` increment) only
/// when a key was resolved and the status is below 400. Any failure here is
/// logged and swallowed: the client path never sees it.
async fn finalize(
    state: &GatewayState,
    mut record: NewRecord,
    user_key: Option<UserKey>,
    start: Instant,
    usage: Option<Usage>,
) {
    record.duration_ms = start.elapsed().as_millis() as i64;
    if let Some(usage) = usage {
        record.input_tokens = usage.input_tokens as i64;
        record.output_tokens = usage.output_tokens as i64;
    }

    let store = state.store.clone();
    let status = record.response_status;
    let key_id = user_key.as_ref().map(|key| key.id);
    let model_name = record.target_model.clone().unwrap_or_default();
    let platform_type = record.target_platform.clone().unwrap_or_default();
    let input_tokens = record.input_tokens;
    let output_tokens = record.output_tokens;

    let record_for_insert = record.clone();
    let result = tokio::task::spawn_blocking(move || -> anyhow::Result<i64> {
        let record_id = store.insert_record(&record_for_insert)?;
        if let Some(key_id) = key_id {
            if status < 400 {
                store.record_usage(
                    key_id,
                    record_id,
                    &model_name,
                    &platform_type,
                    input_tokens,
                    output_tokens,
                )?;
            }
        }
        Ok(record_id)
    })
    .await;

    match result {
        Ok(Ok(record_id)) => {
            let summary = RecordSummary {
                id: record_id,
                method: record.method.clone(),
                path: record.path.clone(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                response_status: record.response_status,
                duration_ms: record.duration_ms,
                target_platform: record.target_platform.clone(),
                target_model: record.target_model.clone(),
                user_key_id: record.user_key_id,
                input_tokens: record.input_tokens,
                output_tokens: record.output_tokens,
                total_tokens: record.input_tokens + record.output_tokens,
            };
            state.broadcaster.broadcast(&summary);
        }
        Ok(Err(e)) => tracing::error!("Failed to persist interaction record: {}", e),
        Err(e) => tracing::error!("Record task panicked: {}", e),
    }
}

/// Record the failure and answer the client
async fn fail(
    state: &GatewayState,
    mut record: NewRecord,
    err: GatewayError,
    start: Instant,
) -> Response<Body> {
    record.response_status = err.status().as_u16();
    record.response_body = Some(err.body_json().to_string());
    finalize(state, record, None, start, None).await;
    axum::response::IntoResponse::into_response(err)
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn base_record(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: Option<&Bytes>,
) -> NewRecord {
    NewRecord {
        method: method.to_string(),
        path: uri.path().to_string(),
        headers: Some(headers_json(headers)),
        body: body
            .filter(|bytes| !bytes.is_empty())
            .map(|bytes| String::from_utf8_lossy(bytes).to_string()),
        ..Default::default()
    }
}

/// Request headers as JSON, with credentials replaced by a hash prefix
fn headers_json(headers: &HeaderMap) -> String {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        let value_str = String::from_utf8_lossy(value.as_bytes()).to_string();
        let stored = if matches!(name.as_str(), "authorization" | "api-key" | "x-api-key") {
            format!("[sha256:{}]", hash_api_key(&value_str))
        } else {
            value_str
        };
        map.insert(name.as_str().to_string(), Value::String(stored));
    }
    Value::Object(map).to_string()
}

fn header_pairs_json(headers: &[(String, String)]) -> String {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        map.insert(name.clone(), Value::String(value.clone()));
    }
    Value::Object(map).to_string()
}

/// Upstream-bound headers as stored in the record; the bearer secret never
/// lands in the database
fn processed_headers_json(adapter: &dyn ProviderClient) -> String {
    let mut map = json!({"Content-Type": "application/json"});
    if adapter.bearer_token().is_some() {
        map["Authorization"] = json!("Bearer [redacted]");
    }
    map.to_string()
}

fn upstream_error(e: &anyhow::Error) -> GatewayError {
    match e.downcast_ref::<UpstreamError>() {
        Some(upstream) => GatewayError::Upstream {
            status: upstream.status,
            body: upstream.body.clone(),
        },
        None => GatewayError::Upstream {
            status: None,
            body: e.to_string(),
        },
    }
}
