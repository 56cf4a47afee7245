//! Resilient streaming pipeline.
//!
//! Three modes serve a `stream:true` request:
//!
//! 1. **Direct** — upstream SSE frames are translated one-to-one.
//! 2. **Fake streaming** — heartbeats keep the connection warm while one
//!    unary call runs on a background task; its result arrives as a single
//!    content chunk.
//! 3. **Anti-truncation** — wraps direct streaming in a continuation loop:
//!    when the upstream stops at a truncation finish reason, a follow-up
//!    call is stitched on with longest-overlap de-duplication so the client
//!    sees one uninterrupted, append-only stream.
//!
//! Every mode terminates the SSE session with `data: [DONE]`; failures
//! surface as an in-band error chunk rather than a dropped connection.
//! Dropping the returned stream (client disconnect) aborts the fake-stream
//! task and stops the continuation loop at its next await.

use std::future::Future;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};

use crate::images::ImageHost;
use crate::models::{GeminiContent, GeminiPart, GeminiPayload};
use crate::translate;
use crate::upstream::UpstreamError;

/// Message substituted when a fake-streamed response was all thinking.
const THINKING_ONLY_PLACEHOLDER: &str = "[模型正在思考中，请稍后再试或重新提问]";

/// Message substituted when a fake-streamed response had no content at all.
const EMPTY_RESPONSE_PLACEHOLDER: &str = "[响应为空，请重新尝试]";

/// Per-request context shared by the pipeline stages.
#[derive(Clone)]
pub struct StreamContext {
    /// Model name as the client requested it (feature suffixes included).
    pub model: String,
    /// Stable id stamped on every chunk of this response.
    pub response_id: String,
    /// Image rehosting client.
    pub images: std::sync::Arc<ImageHost>,
}

/// Continuation policy for anti-truncation mode.
#[derive(Debug, Clone)]
pub struct AntiTruncationConfig {
    /// Upper bound on backend calls (first call included).
    pub max_attempts: u32,
    /// Upstream finish reasons that trigger a continuation.
    pub truncation_reasons: Vec<String>,
    /// Text of the user turn appended to request the continuation.
    pub continuation_prompt: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// SSE framing
// ─────────────────────────────────────────────────────────────────────────────

/// Encode one chunk as an SSE frame.
fn sse_frame(chunk: &Value) -> Bytes {
    Bytes::from(format!("data: {chunk}\n\n"))
}

fn done_frame() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

fn heartbeat_chunk() -> Value {
    json!({
        "choices": [{
            "index": 0,
            "delta": { "role": "assistant", "content": "" },
            "finish_reason": null
        }]
    })
}

/// Final delta chunk carrying an error or placeholder message.
fn closing_content_chunk(content: &str, reasoning: Option<&str>) -> Value {
    let mut delta = json!({ "role": "assistant", "content": content });
    if let Some(reasoning) = reasoning.filter(|r| !r.is_empty()) {
        delta["reasoning_content"] = json!(reasoning);
    }
    json!({
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": "stop"
        }]
    })
}

/// Parse an upstream SSE byte stream into JSON frames.
///
/// Lines without the `data: ` prefix, unparsable payloads, and the
/// upstream's own `[DONE]` are skipped; the gateway writes its own
/// terminator. A transport error ends the stream with one `Err` item.
pub fn gemini_sse_frames<S, E>(
    inner: S,
) -> impl Stream<Item = Result<Value, std::io::Error>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let mut inner = std::pin::pin!(inner);
        let mut buf: Vec<u8> = Vec::new();
        loop {
            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                if let Some(frame) = parse_sse_line(&line) {
                    yield Ok(frame);
                }
            }
            match inner.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    yield Err(std::io::Error::other(e.to_string()));
                    return;
                }
                None => {
                    if let Some(frame) = parse_sse_line(&buf) {
                        yield Ok(frame);
                    }
                    return;
                }
            }
        }
    }
}

fn parse_sse_line(line: &[u8]) -> Option<Value> {
    let trimmed = line
        .strip_suffix(b"\r\n")
        .or_else(|| line.strip_suffix(b"\n"))
        .unwrap_or(line);
    let payload = trimmed.strip_prefix(b"data: ")?;
    if payload == b"[DONE]" {
        return None;
    }
    serde_json::from_slice(payload).ok()
}

// ─────────────────────────────────────────────────────────────────────────────
// Chunk post-processing
// ─────────────────────────────────────────────────────────────────────────────

/// Longest suffix of `accumulated` that is a prefix of `next`, in bytes,
/// aligned to a char boundary.
fn longest_overlap(accumulated: &str, next: &str) -> usize {
    let max = accumulated.len().min(next.len());
    for i in (1..=max).rev() {
        if next.is_char_boundary(i) && accumulated.ends_with(&next[..i]) {
            return i;
        }
    }
    0
}

/// Trim already-emitted text off the chunk's deltas and extend the
/// accumulator with what remains. Returns `false` when nothing is left to
/// send (the whole chunk was a duplicate).
fn trim_emitted_prefix(chunk: &mut Value, accumulated: &mut String) -> bool {
    let mut has_payload = false;
    let Some(choices) = chunk.get_mut("choices").and_then(|v| v.as_array_mut()) else {
        return false;
    };
    for choice in choices.iter_mut() {
        if choice
            .get("finish_reason")
            .is_some_and(|f| !f.is_null())
        {
            has_payload = true;
        }
        let Some(delta) = choice.get_mut("delta").and_then(|v| v.as_object_mut()) else {
            continue;
        };
        if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
            let overlap = longest_overlap(accumulated, text);
            let to_send = text[overlap..].to_string();
            if to_send.is_empty() {
                delta.remove("content");
            } else {
                accumulated.push_str(&to_send);
                delta.insert("content".to_string(), Value::String(to_send));
                has_payload = true;
            }
        }
        if delta.contains_key("reasoning_content") || delta.contains_key("tool_calls") {
            has_payload = true;
        }
    }
    has_payload
}

/// Rehost inline data-URI images inside the chunk's content deltas.
async fn rehost_chunk_images(chunk: &mut Value, images: &ImageHost) {
    if !images.is_enabled() {
        return;
    }
    let Some(choices) = chunk.get_mut("choices").and_then(|v| v.as_array_mut()) else {
        return;
    };
    for choice in choices.iter_mut() {
        let Some(content) = choice.get_mut("delta").and_then(|d| d.get_mut("content")) else {
            continue;
        };
        let Some(text) = content.as_str().map(|s| s.to_string()) else {
            continue;
        };
        *content = Value::String(images.rewrite_markdown_images(&text).await);
    }
}

fn chunk_has_choices(chunk: &Value) -> bool {
    chunk
        .get("choices")
        .and_then(|v| v.as_array())
        .is_some_and(|c| !c.is_empty())
}

// ─────────────────────────────────────────────────────────────────────────────
// Mode 1: direct streaming
// ─────────────────────────────────────────────────────────────────────────────

/// Translate an upstream SSE byte stream frame-by-frame.
pub fn direct_stream<S, E>(
    upstream: S,
    ctx: StreamContext,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let frames = gemini_sse_frames(upstream);
        let mut frames = std::pin::pin!(frames);
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(frame) => {
                    let (mut chunk, _) =
                        translate::gemini_chunk_to_openai(&frame, &ctx.model, &ctx.response_id);
                    if !chunk_has_choices(&chunk) {
                        continue;
                    }
                    rehost_chunk_images(&mut chunk, &ctx.images).await;
                    yield Ok(sse_frame(&chunk));
                }
                Err(e) => {
                    tracing::error!(error = %e, "stream transport error");
                    yield Ok(sse_frame(&closing_content_chunk(
                        &format!("Stream error: {e}"),
                        None,
                    )));
                    yield Ok(done_frame());
                    return;
                }
            }
        }
        yield Ok(done_frame());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mode 2: fake streaming
// ─────────────────────────────────────────────────────────────────────────────

/// Abort the background call when the client goes away.
struct AbortOnDrop<T>(tokio::task::JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Serve a streaming session from one unary backend call.
///
/// An immediate heartbeat opens the session, another follows every
/// `heartbeat_secs` until the call resolves, then the full content arrives
/// as a single chunk with `finish_reason:"stop"`.
pub fn fake_stream<F>(
    call: F,
    heartbeat_secs: u64,
    ctx: StreamContext,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static
where
    F: Future<Output = Result<String, UpstreamError>> + Send + 'static,
{
    async_stream::stream! {
        yield Ok(sse_frame(&heartbeat_chunk()));

        let mut task = AbortOnDrop(tokio::spawn(call));
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(heartbeat_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // the first tick is immediate

        let outcome = loop {
            tokio::select! {
                result = &mut task.0 => break result,
                _ = ticker.tick() => {
                    yield Ok(sse_frame(&heartbeat_chunk()));
                }
            }
        };

        let body = match outcome {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "fake streaming request failed");
                yield Ok(sse_frame(&closing_content_chunk(&format!("Error: {e}"), None)));
                yield Ok(done_frame());
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "fake streaming task failed");
                yield Ok(sse_frame(&closing_content_chunk(&format!("Error: {e}"), None)));
                yield Ok(done_frame());
                return;
            }
        };

        let chunk = match serde_json::from_str::<Value>(&body) {
            Ok(response) => {
                let (content, reasoning) = extract_unary_content(&response);
                if content.is_empty() && !reasoning.is_empty() {
                    tracing::warn!("fake stream response contains only thinking content");
                    closing_content_chunk(THINKING_ONLY_PLACEHOLDER, Some(reasoning.as_str()))
                } else if content.is_empty() {
                    tracing::warn!("no content found in fake stream response");
                    closing_content_chunk(EMPTY_RESPONSE_PLACEHOLDER, None)
                } else {
                    let content = ctx.images.rewrite_markdown_images(&content).await;
                    closing_content_chunk(&content, Some(reasoning.as_str()))
                }
            }
            // An unparsable 2xx body is passed through as the message.
            Err(_) => closing_content_chunk(&body, None),
        };
        yield Ok(sse_frame(&chunk));
        yield Ok(done_frame());
    }
}

/// Content and reasoning of a unary response body, accepting both the
/// Gemini candidate shape and an already-OpenAI shape.
fn extract_unary_content(response: &Value) -> (String, String) {
    let response = translate::unwrap_response_envelope(response);
    if let Some(candidate) = response
        .get("candidates")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
    {
        let parts = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
            .cloned()
            .unwrap_or_default();
        let (mut content, reasoning) = translate::extract_content_and_reasoning(&parts);
        content.push_str(&translate::extract_first_image_markdown(&parts));
        return (content, reasoning);
    }
    if let Some(content) = response
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
    {
        return (content.to_string(), String::new());
    }
    (String::new(), String::new())
}

// ─────────────────────────────────────────────────────────────────────────────
// Mode 3: anti-truncation streaming
// ─────────────────────────────────────────────────────────────────────────────

/// Direct streaming with transparent continuation across truncation.
///
/// `connect` opens one backend stream for a payload; it is called again
/// with the conversation extended by the text emitted so far whenever the
/// upstream finishes with a configured truncation reason and attempts
/// remain. De-duplication keeps the client-visible stream append-only.
pub fn anti_truncation_stream<C, Fut, S, E>(
    mut connect: C,
    base_payload: GeminiPayload,
    config: AntiTruncationConfig,
    ctx: StreamContext,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static
where
    C: FnMut(GeminiPayload) -> Fut + Send + 'static,
    Fut: Future<Output = Result<S, UpstreamError>> + Send,
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let mut accumulated = String::new();
        let mut payload = base_payload.clone();
        let mut calls_made = 0u32;

        'attempts: loop {
            let upstream = match connect(payload.clone()).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "anti-truncation call failed");
                    yield Ok(sse_frame(&closing_content_chunk(&format!("Stream error: {e}"), None)));
                    yield Ok(done_frame());
                    return;
                }
            };
            calls_made += 1;

            let frames = gemini_sse_frames(upstream);
            let mut frames = std::pin::pin!(frames);
            let mut truncated = false;

            while let Some(frame) = frames.next().await {
                let frame = match frame {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::error!(error = %e, "stream transport error");
                        yield Ok(sse_frame(&closing_content_chunk(
                            &format!("Stream error: {e}"),
                            None,
                        )));
                        yield Ok(done_frame());
                        return;
                    }
                };

                let (mut chunk, gemini_finish) =
                    translate::gemini_chunk_to_openai(&frame, &ctx.model, &ctx.response_id);

                let hit_truncation = gemini_finish
                    .as_deref()
                    .is_some_and(|f| config.truncation_reasons.iter().any(|r| r == f));
                let will_continue = hit_truncation && calls_made < config.max_attempts;

                if will_continue {
                    // The client must not see a finish while we continue.
                    if let Some(choices) = chunk.get_mut("choices").and_then(|v| v.as_array_mut()) {
                        for choice in choices.iter_mut() {
                            choice["finish_reason"] = Value::Null;
                        }
                    }
                }

                if !trim_emitted_prefix(&mut chunk, &mut accumulated) {
                    if will_continue {
                        truncated = true;
                    }
                    continue;
                }
                rehost_chunk_images(&mut chunk, &ctx.images).await;
                yield Ok(sse_frame(&chunk));

                if will_continue {
                    truncated = true;
                }
            }

            if truncated {
                tracing::info!(
                    attempt = calls_made,
                    emitted_chars = accumulated.len(),
                    "continuing truncated stream"
                );
                payload = continuation_payload(&base_payload, &accumulated, &config.continuation_prompt);
                continue 'attempts;
            }
            break;
        }

        yield Ok(done_frame());
    }
}

/// Original prompt + the text emitted so far as a model turn + the
/// continuation prompt as a user turn.
fn continuation_payload(
    base: &GeminiPayload,
    accumulated: &str,
    continuation_prompt: &str,
) -> GeminiPayload {
    let mut payload = base.clone();
    payload.request.contents.push(GeminiContent {
        role: "model".to_string(),
        parts: vec![GeminiPart::text(accumulated.to_string())],
    });
    payload.request.contents.push(GeminiContent {
        role: "user".to_string(),
        parts: vec![GeminiPart::text(continuation_prompt.to_string())],
    });
    payload
}
