//! OpenAI-compatible chat endpoints, for both credential namespaces.

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::default_safety_settings;
use crate::features;
use crate::models::{ChatCompletionRequest, MessageContent, Model, ModelList};
use crate::storage::Namespace;
use crate::streaming::{self, AntiTruncationConfig, StreamContext};
use crate::translate;
use crate::upstream::UpstreamError;

use super::routes::SharedState;
use super::{auth, error_response};

const TEXT_EVENT_STREAM: &str = "text/event-stream";
const NO_CACHE: &str = "no-cache";

/// Canned completion for the health-check probe.
const HEALTH_CHECK_REPLY: &str = "gcli2api正常工作中";

// ─────────────────────────────────────────────────────────────────────────────
// Route entry points
// ─────────────────────────────────────────────────────────────────────────────

pub async fn chat_completions_v1(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    chat_completions(state, Namespace::Standard, headers, body).await
}

pub async fn chat_completions_antigravity(
    State(state): State<SharedState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    chat_completions(state, Namespace::Antigravity, headers, body).await
}

pub async fn list_models_v1(
    State(state): State<SharedState>,
    Query(query): Query<ModelsQuery>,
    headers: HeaderMap,
) -> Response {
    list_models(state, Namespace::Standard, query, headers).await
}

pub async fn list_models_antigravity(
    State(state): State<SharedState>,
    Query(query): Query<ModelsQuery>,
    headers: HeaderMap,
) -> Response {
    list_models(state, Namespace::Antigravity, query, headers).await
}

// ─────────────────────────────────────────────────────────────────────────────
// GET /v1/models
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ModelsQuery {
    key: Option<String>,
}

async fn list_models(
    state: SharedState,
    ns: Namespace,
    query: ModelsQuery,
    headers: HeaderMap,
) -> Response {
    let settings = state.settings();
    let password = settings.api_password().await;
    let ids = features::feature_model_ids(&settings.base_models().await);

    if auth::bearer_token(&headers).is_none() {
        // `?key=` callers get the Gemini-native listing shape.
        if let Some(key) = &query.key {
            if !auth::constant_time_eq(key, &password) {
                return error_response(
                    StatusCode::FORBIDDEN,
                    "Invalid password".to_string(),
                    "authentication_error",
                );
            }
            return Json(gemini_model_list(&ids)).into_response();
        }
        // The antigravity listing is open; the primary one requires auth.
        if ns == Namespace::Antigravity {
            return Json(openai_model_list(&ids)).into_response();
        }
        return error_response(
            StatusCode::UNAUTHORIZED,
            "Missing bearer authorization".to_string(),
            "authentication_error",
        );
    }

    if let Err(resp) = auth::verify_bearer(&headers, &password) {
        return resp;
    }
    Json(openai_model_list(&ids)).into_response()
}

fn openai_model_list(ids: &[String]) -> ModelList {
    ModelList::new(ids.iter().map(Model::new).collect())
}

fn gemini_model_list(ids: &[String]) -> Value {
    let models: Vec<Value> = ids
        .iter()
        .map(|id| {
            json!({
                "name": format!("models/{id}"),
                "displayName": id,
                "supportedGenerationMethods": ["generateContent", "streamGenerateContent"],
            })
        })
        .collect();
    json!({ "models": models })
}

// ─────────────────────────────────────────────────────────────────────────────
// POST /v1/chat/completions
// ─────────────────────────────────────────────────────────────────────────────

async fn chat_completions(
    state: SharedState,
    ns: Namespace,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let settings = state.settings();
    let password = settings.api_password().await;
    if let Err(resp) = auth::verify_bearer(&headers, &password) {
        return resp;
    }

    let mut req: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("Invalid request body: {e}"),
                "invalid_request_error",
            );
        }
    };

    // Probes short-circuit before touching the pool.
    if is_health_check(&req) {
        return Json(json!({
            "choices": [{
                "message": { "role": "assistant", "content": HEALTH_CHECK_REPLY }
            }]
        }))
        .into_response();
    }

    normalize_request(&mut req);

    let display_model = req.model.clone();
    let features = features::decode(&display_model);
    let is_streaming = req.stream;
    if features.anti_truncation && !is_streaming {
        tracing::warn!("anti-truncation only applies to streaming requests, ignoring");
    }

    let compatibility = settings.compatibility_mode().await;
    let payload = translate::openai_to_gemini(
        &req,
        &features,
        compatibility,
        default_safety_settings(),
    );

    let pool = state.pool(ns);
    if pool
        .get_valid_credential(Some(&features.base_model))
        .await
        .is_none()
    {
        tracing::error!("no usable credential for request");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "no credentials available".to_string(),
            "no_credentials",
        );
    }
    pool.increment_call_count().await;

    let ctx = StreamContext {
        model: display_model.clone(),
        response_id: format!("chatcmpl-{}", Uuid::new_v4()),
        images: state.images.clone(),
    };

    if features.fake_streaming && is_streaming {
        let heartbeat_secs = settings.heartbeat_interval_seconds().await;
        let upstream = state.upstream.clone();
        let pool = pool.clone();
        let call_settings = settings.clone();
        let call_payload = payload.clone();
        let model_key = features.base_model.clone();
        let call = async move {
            upstream
                .generate(&pool, &call_settings, &call_payload, &model_key)
                .await
        };
        return sse_response(streaming::fake_stream(call, heartbeat_secs, ctx));
    }

    if features.anti_truncation && is_streaming {
        let config = AntiTruncationConfig {
            max_attempts: settings.anti_truncation_max_attempts().await,
            truncation_reasons: settings.truncation_finish_reasons().await,
            continuation_prompt: settings.continuation_prompt().await,
        };
        tracing::info!(max_attempts = config.max_attempts, "anti-truncation streaming enabled");
        let upstream = state.upstream.clone();
        let pool = pool.clone();
        let call_settings = settings.clone();
        let model_key = features.base_model.clone();
        let connect = move |p: crate::models::GeminiPayload| {
            let upstream = upstream.clone();
            let pool = pool.clone();
            let settings = call_settings.clone();
            let model_key = model_key.clone();
            async move {
                let resp = upstream
                    .stream_generate(&pool, &settings, &p, &model_key)
                    .await?;
                Ok(resp.bytes_stream())
            }
        };
        return sse_response(streaming::anti_truncation_stream(connect, payload, config, ctx));
    }

    if is_streaming {
        return match state
            .upstream
            .stream_generate(&pool, &settings, &payload, &features.base_model)
            .await
        {
            Ok(resp) => sse_response(streaming::direct_stream(resp.bytes_stream(), ctx)),
            Err(e) => upstream_error_response(e),
        };
    }

    // Unary path.
    let body = match state
        .upstream
        .generate(&pool, &settings, &payload, &features.base_model)
        .await
    {
        Ok(body) => body,
        Err(e) => return upstream_error_response(e),
    };
    let parsed: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!(error = %e, "response conversion failed");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Response conversion failed".to_string(),
                "conversion_error",
            );
        }
    };
    let mut openai = translate::gemini_response_to_openai(&parsed, &display_model);
    rehost_unary_images(&state, &mut openai).await;
    Json(openai).into_response()
}

/// Clamp and filter the inbound request before translation.
fn normalize_request(req: &mut ChatCompletionRequest) {
    if let Some(max_tokens) = req.max_tokens {
        if max_tokens > translate::MAX_OUTPUT_TOKENS {
            req.max_tokens = Some(translate::MAX_OUTPUT_TOKENS);
        }
    }
    req.top_k = Some(translate::FORCED_TOP_K);
    req.messages
        .retain(|m| m.content.as_ref().is_some_and(|c| !c.is_effectively_empty()));
}

fn is_health_check(req: &ChatCompletionRequest) -> bool {
    req.messages.len() == 1
        && req.messages[0].role == "user"
        && matches!(
            &req.messages[0].content,
            Some(MessageContent::Text(text)) if text == "Hi"
        )
}

/// Rewrite inline data-URI images in a unary response's message contents.
async fn rehost_unary_images(state: &SharedState, openai: &mut Value) {
    if !state.images.is_enabled() {
        return;
    }
    let Some(choices) = openai.get_mut("choices").and_then(|v| v.as_array_mut()) else {
        return;
    };
    for choice in choices.iter_mut() {
        let Some(content) = choice.get_mut("message").and_then(|m| m.get_mut("content")) else {
            continue;
        };
        let Some(text) = content.as_str().map(|s| s.to_string()) else {
            continue;
        };
        *content = Value::String(state.images.rewrite_markdown_images(&text).await);
    }
}

fn sse_response(
    stream: impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(TEXT_EVENT_STREAM));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE));
    (StatusCode::OK, headers, axum::body::Body::from_stream(stream)).into_response()
}

fn upstream_error_response(error: UpstreamError) -> Response {
    match error {
        UpstreamError::NoCredentials => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "no credentials available".to_string(),
            "no_credentials",
        ),
        UpstreamError::Status { status, .. } => {
            tracing::error!(status, "backend request failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("backend returned status {status}"),
                "upstream_error",
            )
        }
        UpstreamError::Network(e) => {
            tracing::error!(error = %e, "backend unreachable");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "backend unreachable".to_string(),
                "upstream_error",
            )
        }
    }
}
